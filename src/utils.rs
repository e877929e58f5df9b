use std::ops::{Deref, RangeBounds};

use wgpu::util::DeviceExt;

/// Copies `values` into `buffer` through a staging buffer, encoded into
/// `encoder` so it lands before any sort work recorded afterwards.
pub fn upload_to_buffer<T: bytemuck::Pod>(
    encoder: &mut wgpu::CommandEncoder,
    buffer: &wgpu::Buffer,
    device: &wgpu::Device,
    values: &[T],
) {
    let staging_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("staging buffer"),
        contents: bytemuck::cast_slice(values),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    });
    encoder.copy_buffer_to_buffer(&staging_buffer, 0, buffer, 0, staging_buffer.size());
}

/// Reads `range` of `buffer` back to the host. Blocks until the device is
/// idle; only meant for tests, demos and the bench.
pub async fn download_buffer<T: Clone + bytemuck::Pod>(
    buffer: &wgpu::Buffer,
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    range: impl RangeBounds<wgpu::BufferAddress>,
) -> Vec<T> {
    // copy buffer data
    let download_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("download buffer"),
        size: buffer.size(),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("copy encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &download_buffer, 0, buffer.size());
    queue.submit([encoder.finish()]);

    // download buffer
    let buffer_slice = download_buffer.slice(range);
    let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| tx.send(result).unwrap());
    device.poll(wgpu::Maintain::Wait).panic_on_timeout();
    rx.receive().await.unwrap().unwrap();

    let data = buffer_slice.get_mapped_range();
    return bytemuck::cast_slice(data.deref()).to_vec();
}

/// Maps a view depth to a sort key such that unsigned comparison of the keys
/// matches the total order of the depths.
///
/// The preprocess stage must apply this before writing depth keys; both the
/// host and the shaders then treat keys as plain unsigned integers.
pub fn depth_to_key(depth: f32) -> u32 {
    let bits = depth.to_bits();
    if bits & 0x8000_0000 != 0 {
        // negative: flip all bits so more negative sorts lower
        !bits
    } else {
        bits | 0x8000_0000
    }
}

#[cfg(test)]
mod tests {
    use super::depth_to_key;

    #[test]
    fn depth_to_key_preserves_order() {
        let depths = [
            f32::NEG_INFINITY,
            -1.0e30,
            -2.5,
            -1.0,
            -f32::MIN_POSITIVE,
            0.0,
            f32::MIN_POSITIVE,
            0.5,
            1.0,
            1.0e30,
            f32::INFINITY,
        ];
        for pair in depths.windows(2) {
            assert!(
                depth_to_key(pair[0]) < depth_to_key(pair[1]),
                "{} and {} must map to increasing keys",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn depth_to_key_splits_at_the_sign() {
        assert_eq!(depth_to_key(0.0), 0x8000_0000);
        // -0.0 keys immediately below +0.0
        assert_eq!(depth_to_key(-0.0), 0x7fff_ffff);
    }
}
