/*
    Host-side fallback sorter.

    Instead of consuming the gpu key buffer it re-derives every splat's view
    depth from host-resident positions and the current view matrix, argsorts
    the indices (stable, depth ascending, so the most distant splat comes
    first) and uploads them into the sorted-values buffer. The key/value
    input buffers still exist so the upstream preprocess dispatch has valid
    targets; their contents are ignored.

    This is the ground truth the gpu sorters are tested against.
*/

use bytemuck::cast_slice;
use float_ord::FloatOrd;
use glam::{Mat4, Vec3};

use crate::{check_device_limits, padded_size, InputBuffers, Sorter, SorterError};

struct CpuBuffers {
    keys: wgpu::Buffer,
    values: wgpu::Buffer,
    sorted_values: wgpu::Buffer,
    capacity: u32,
}

impl CpuBuffers {
    fn destroy(&self) {
        self.keys.destroy();
        self.values.destroy();
        self.sorted_values.destroy();
    }
}

/// Cpu fallback sorter; sorts splat indices by view depth on the host.
pub struct CpuSorter {
    positions: Vec<Vec3>,
    view: Mat4,
    buffers: Option<CpuBuffers>,
}

impl CpuSorter {
    pub fn new() -> Self {
        log::info!("created cpu fallback sorter");
        Self {
            positions: Vec::new(),
            view: Mat4::IDENTITY,
            buffers: None,
        }
    }

    /// Replaces the splat positions depths are derived from.
    pub fn set_positions(&mut self, positions: Vec<Vec3>) {
        self.positions = positions;
    }

    /// Sets the view matrix used by subsequent [`Sorter::sort`] calls.
    pub fn set_view(&mut self, view: Mat4) {
        self.view = view;
    }

    /// View depth of one splat: the third row of the view matrix applied to
    /// the homogeneous position.
    fn depth(view: &Mat4, position: Vec3) -> f32 {
        view.row(2).dot(position.extend(1.0))
    }

    /// Indices of the first `n` positions, stably sorted by depth ascending.
    fn sorted_indices(&self, n: usize) -> Vec<u32> {
        let depths: Vec<f32> = self.positions[..n]
            .iter()
            .map(|p| Self::depth(&self.view, *p))
            .collect();
        let mut indices: Vec<u32> = (0..n as u32).collect();
        indices.sort_by_key(|&i| FloatOrd(depths[i as usize]));
        indices
    }
}

impl Default for CpuSorter {
    fn default() -> Self {
        Self::new()
    }
}

impl Sorter for CpuSorter {
    fn ensure_capacity(&mut self, device: &wgpu::Device, capacity: u32) -> Result<(), SorterError> {
        if let Some(buffers) = &self.buffers {
            if buffers.capacity >= capacity {
                return Ok(());
            }
        }
        let padded = padded_size(capacity);
        check_device_limits(device, padded)?;

        if let Some(old) = self.buffers.take() {
            log::debug!(
                "growing cpu sorter buffers from {} to {} elements",
                old.capacity,
                padded
            );
            old.destroy();
        }

        // dummy targets for the preprocess dispatch; never read back
        let keyval_size = padded as u64 * std::mem::size_of::<u32>() as u64;
        let make = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: keyval_size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        self.buffers = Some(CpuBuffers {
            keys: make("cpu sorter keys buffer"),
            values: make("cpu sorter values buffer"),
            sorted_values: make("cpu sorter sorted indices buffer"),
            capacity: padded,
        });
        Ok(())
    }

    fn input_buffers(&self) -> Result<InputBuffers<'_>, SorterError> {
        let buffers = self.buffers.as_ref().ok_or_else(|| {
            SorterError::PreconditionViolated(
                "ensure_capacity must be called before input_buffers".into(),
            )
        })?;
        Ok(InputBuffers {
            keys: &buffers.keys,
            values: &buffers.values,
        })
    }

    fn sort<'a>(
        &'a self,
        _encoder: &mut wgpu::CommandEncoder,
        queue: &wgpu::Queue,
        num_elements: u32,
    ) -> Result<&'a wgpu::Buffer, SorterError> {
        let buffers = self.buffers.as_ref().ok_or_else(|| {
            SorterError::PreconditionViolated("ensure_capacity must be called before sort".into())
        })?;
        if num_elements > buffers.capacity {
            return Err(SorterError::PreconditionViolated(format!(
                "sort of {} elements exceeds the allocated capacity of {}",
                num_elements, buffers.capacity
            )));
        }
        if num_elements as usize > self.positions.len() {
            return Err(SorterError::PreconditionViolated(format!(
                "sort of {} elements but only {} splat positions are set",
                num_elements,
                self.positions.len()
            )));
        }
        if num_elements == 0 {
            return Ok(&buffers.sorted_values);
        }

        let indices = self.sorted_indices(num_elements as usize);
        queue.write_buffer(&buffers.sorted_values, 0, cast_slice(&indices));
        Ok(&buffers.sorted_values)
    }

    fn destroy(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            buffers.destroy();
        }
    }
}
