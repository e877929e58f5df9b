/*
    Host driver for the unstable 256-radix reference sort.

    Same three-phase pass structure as the stable core, but with 8 bits per
    digit (4 passes) and a scatter that claims write slots by atomically
    incrementing the scanned prefix. Equal keys may therefore reorder
    between runs; the sorted result is a valid permutation but the order of
    ties is not reproducible. Kept as a throughput reference and as a
    multiset oracle for the stable sort.
*/

use bytemuck::bytes_of;
use wgpu::ComputePassDescriptor;

use crate::{
    check_device_limits, padded_size, storage_buffer_entry, uniform_buffer_entry, InputBuffers,
    PassInfo, Sorter, SorterError, ELEMENTS_PER_THREAD, TILE_SIZE, WG_SIZE,
};

/// the reference sort takes a whole byte per pass
pub const BITS_PER_PASS: u32 = 8;

/// 256 entries in the digit table
pub const RADIX: u32 = 1 << BITS_PER_PASS;

/// 4 passes cover a 32 bit key
pub const NUM_PASSES: u32 = 32 / BITS_PER_PASS;

struct UnstableBuffers {
    keys_a: wgpu::Buffer,
    keys_b: wgpu::Buffer,
    values_a: wgpu::Buffer,
    values_b: wgpu::Buffer,
    histogram: wgpu::Buffer,
    bind_groups: Vec<wgpu::BindGroup>,
    capacity: u32,
}

impl UnstableBuffers {
    fn destroy(&self) {
        self.keys_a.destroy();
        self.keys_b.destroy();
        self.values_a.destroy();
        self.values_b.destroy();
        self.histogram.destroy();
    }
}

/// Unstable gpu radix sorter (radix 256, 4 passes).
pub struct UnstableSorter {
    bind_group_layout: wgpu::BindGroupLayout,
    histogram_p: wgpu::ComputePipeline,
    prefix_p: wgpu::ComputePipeline,
    scatter_p: wgpu::ComputePipeline,
    pass_uniforms: Vec<wgpu::Buffer>,
    buffers: Option<UnstableBuffers>,
}

impl UnstableSorter {
    pub fn new(device: &wgpu::Device) -> Self {
        let bind_group_layout = Self::bind_group_layout(device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("unstable radix sort pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let shader_code = format!(
            "const WG_SIZE: u32 = {:}u;\n\
            const ELEMENTS_PER_THREAD: u32 = {:}u;\n\
            const TILE_SIZE: u32 = {:}u;\n\
            const RADIX: u32 = {:}u;\n\
            const BITS_PER_PASS: u32 = {:}u;\n{:}",
            WG_SIZE,
            ELEMENTS_PER_THREAD,
            TILE_SIZE,
            RADIX,
            BITS_PER_PASS,
            include_str!("unstable_sort.wgsl")
        )
        .replace("{wg_size}", WG_SIZE.to_string().as_str());

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("unstable radix sort shader"),
            source: wgpu::ShaderSource::Wgsl(shader_code.into()),
        });

        let histogram_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("unstable sort histogram"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "histogram",
            compilation_options: Default::default(),
            cache: None,
        });
        let prefix_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("unstable sort global prefix"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "prefix_sum",
            compilation_options: Default::default(),
            cache: None,
        });
        let scatter_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("unstable sort scatter"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "scatter",
            compilation_options: Default::default(),
            cache: None,
        });

        let pass_uniforms = (0..NUM_PASSES)
            .map(|pass| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("unstable sort pass {} uniform", pass)),
                    size: std::mem::size_of::<PassInfo>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        log::info!("created unstable sorter (radix {}, {} passes)", RADIX, NUM_PASSES);

        return Self {
            bind_group_layout,
            histogram_p,
            prefix_p,
            scatter_p,
            pass_uniforms,
            buffers: None,
        };
    }

    fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        return device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("unstable radix sort bind group layout"),
            entries: &[
                uniform_buffer_entry(0),
                storage_buffer_entry(1, true),
                storage_buffer_entry(2, true),
                storage_buffer_entry(3, false),
                storage_buffer_entry(4, false),
                storage_buffer_entry(5, false),
            ],
        });
    }
}

impl Sorter for UnstableSorter {
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
                "growing unstable sort buffers from {} to {} elements",
                old.capacity,
                padded
            );
            old.destroy();
        }

        let keyval_size = padded as u64 * std::mem::size_of::<u32>() as u64;
        let primary = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: keyval_size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };
        let aux = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: keyval_size,
                usage: wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            })
        };
        let keys_a = primary("unstable sort keys buffer");
        let values_a = primary("unstable sort values buffer");
        let keys_b = aux("unstable sort keys auxiliary buffer");
        let values_b = aux("unstable sort values auxiliary buffer");

        let num_workgroups = padded / TILE_SIZE;
        let histogram = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("unstable sort histogram buffer"),
            size: (RADIX * num_workgroups) as u64 * std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let bind_groups = (0..NUM_PASSES)
            .map(|pass| {
                let (read_keys, read_values, write_keys, write_values) = if pass % 2 == 0 {
                    (&keys_a, &values_a, &keys_b, &values_b)
                } else {
                    (&keys_b, &values_b, &keys_a, &values_a)
                };
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("unstable sort pass {} bind group", pass)),
                    layout: &self.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: self.pass_uniforms[pass as usize].as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: read_keys.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: read_values.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: write_keys.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 4,
                            resource: write_values.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 5,
                            resource: histogram.as_entire_binding(),
                        },
                    ],
                })
            })
            .collect();

        self.buffers = Some(UnstableBuffers {
            keys_a,
            keys_b,
            values_a,
            values_b,
            histogram,
            bind_groups,
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
            keys: &buffers.keys_a,
            values: &buffers.values_a,
        })
    }

    fn sort<'a>(
        &'a self,
        encoder: &mut wgpu::CommandEncoder,
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
        if num_elements == 0 {
            return Ok(&buffers.values_a);
        }

        let num_workgroups = num_elements.div_ceil(TILE_SIZE);
        for pass in 0..NUM_PASSES {
            let info = PassInfo {
                num_elements,
                bit_offset: pass * BITS_PER_PASS,
                num_workgroups,
                is_first_pass: (pass == 0) as u32,
            };
            queue.write_buffer(&self.pass_uniforms[pass as usize], 0, bytes_of(&info));
        }

        for pass in 0..NUM_PASSES {
            let bind_group = &buffers.bind_groups[pass as usize];
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some("unstable sort histogram"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.histogram_p);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(num_workgroups, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some("unstable sort global prefix"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.prefix_p);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(1, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some("unstable sort scatter"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.scatter_p);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(num_workgroups, 1, 1);
            }
        }

        Ok(&buffers.values_a)
    }

    fn destroy(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            buffers.destroy();
        }
    }
}
