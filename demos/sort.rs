// this example creates 10 key-value pairs and sorts them with the stable
// gpu sorter
use splat_sort::{
    utils::{download_buffer, upload_to_buffer},
    build_sorter, SortVariant, Sorter,
};

#[pollster::main]
async fn main() {
    env_logger::init();

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

    let adapter = wgpu::util::initialize_adapter_from_env_or_default(&instance, None)
        .await
        .unwrap();

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await
        .unwrap();

    let mut sorter = build_sorter(&device, SortVariant::GpuStablePortable);

    let n = 10u32;
    sorter.ensure_capacity(&device, n).unwrap();

    let keys_scrambled: Vec<u32> = (0..n).rev().collect();
    let values: Vec<u32> = (0..n).collect();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });

    let input = sorter.input_buffers().unwrap();
    upload_to_buffer(&mut encoder, input.keys, &device, keys_scrambled.as_slice());
    upload_to_buffer(&mut encoder, input.values, &device, values.as_slice());

    println!(
        "before: {:?}",
        keys_scrambled
            .iter()
            .zip(values.iter())
            .collect::<Vec<(_, _)>>()
    );

    let sorted_values = sorter.sort(&mut encoder, &queue, n).unwrap();

    // wait for the sorter to finish
    let byte_len = n as u64 * std::mem::size_of::<u32>() as u64;
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let values_sorted = download_buffer::<u32>(sorted_values, &device, &queue, 0..byte_len).await;
    let keys_sorted = download_buffer::<u32>(
        sorter.input_buffers().unwrap().keys,
        &device,
        &queue,
        0..byte_len,
    )
    .await;

    println!(
        "after: {:?}",
        keys_sorted
            .iter()
            .zip(values_sorted.iter())
            .collect::<Vec<(_, _)>>()
    );
}
