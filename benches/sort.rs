use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use splat_sort::{
    utils::{download_buffer, upload_to_buffer},
    ScatterKind, Sorter, StableSorter, UnstableSorter,
};

struct BenchContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    query_set: wgpu::QuerySet,
    query_buffer: wgpu::Buffer,
}

async fn setup() -> BenchContext {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

    let adapter = wgpu::util::initialize_adapter_from_env_or_default(&instance, None)
        .await
        .unwrap();

    let required_features = wgpu::Features::TIMESTAMP_QUERY
        | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS
        | (adapter.features() & wgpu::Features::SUBGROUP);

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features,
                required_limits: wgpu::Limits {
                    max_buffer_size: 1 << 30,
                    max_storage_buffer_binding_size: 1 << 30,
                    ..Default::default()
                },
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await
        .unwrap();

    let capacity = 2;
    let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
        label: Some("time stamp query set"),
        ty: wgpu::QueryType::Timestamp,
        count: capacity,
    });

    let query_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("query set buffer"),
        size: capacity as u64 * std::mem::size_of::<u64>() as u64,
        usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    return BenchContext {
        device,
        queue,
        query_set,
        query_buffer,
    };
}

async fn time_sort(
    context: &BenchContext,
    sorter: &dyn Sorter,
    n: u32,
    iters: u32,
) -> Duration {
    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });

    encoder.write_timestamp(&context.query_set, 0);
    for _ in 0..iters {
        sorter.sort(&mut encoder, &context.queue, n).unwrap();
    }
    encoder.write_timestamp(&context.query_set, 1);
    encoder.resolve_query_set(&context.query_set, 0..2, &context.query_buffer, 0);

    let idx = context.queue.submit([encoder.finish()]);
    context
        .device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let timestamps: Vec<u64> =
        download_buffer(&context.query_buffer, &context.device, &context.queue, ..).await;
    let diff_ticks = timestamps[1] - timestamps[0];
    let period = context.queue.get_timestamp_period();
    return Duration::from_nanos((diff_ticks as f32 * period / iters as f32) as u64);
}

async fn bench_sorter(context: &BenchContext, sorter: &mut dyn Sorter, label: &str, n: u32) {
    sorter.ensure_capacity(&context.device, n).unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
    let values: Vec<u32> = (0..n).collect();

    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    let input = sorter.input_buffers().unwrap();
    upload_to_buffer(&mut encoder, input.keys, &context.device, &keys);
    upload_to_buffer(&mut encoder, input.values, &context.device, &values);
    context.queue.submit([encoder.finish()]);

    let d = time_sort(context, sorter, n, 200).await;
    println!("{label:>24} n = {n:>8}: {d:?}");
}

#[pollster::main]
async fn main() {
    env_logger::init();
    let context = setup().await;

    for n in [100_000u32, 1_000_000, 8_000_000] {
        let mut stable_fused = StableSorter::new(&context.device, ScatterKind::Fused, false);
        bench_sorter(&context, &mut stable_fused, "stable fused", n).await;

        let mut stable_separated =
            StableSorter::new(&context.device, ScatterKind::Separated, false);
        bench_sorter(&context, &mut stable_separated, "stable separated", n).await;

        let mut stable_subgroup = StableSorter::new(&context.device, ScatterKind::Fused, true);
        if stable_subgroup.uses_subgroups() {
            bench_sorter(&context, &mut stable_subgroup, "stable subgroup", n).await;
        }

        let mut unstable = UnstableSorter::new(&context.device);
        bench_sorter(&context, &mut unstable, "unstable radix 256", n).await;
    }
}
