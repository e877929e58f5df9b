/*
    Host driver for the stable 16-radix sort.

    Every pass runs three phases: a block phase that builds per-workgroup
    digit histograms (and, in the separated mode, per-element local ranks),
    a single-workgroup exclusive prefix scan over the digit-major histogram,
    and a scatter that places every element at
    global_prefix(digit, workgroup) + local_rank. Read and write buffer
    pairs swap after each pass; the pass count is even, so the result always
    lands in the pair exposed through `input_buffers`.
*/

use bytemuck::bytes_of;
use wgpu::ComputePassDescriptor;

use crate::{
    check_device_limits, padded_size, storage_buffer_entry, uniform_buffer_entry, InputBuffers,
    PassInfo, Sorter, SorterError, ELEMENTS_PER_THREAD, TILE_SIZE, WG_SIZE,
};

/// the stable core sorts 4 bits per pass
pub const BITS_PER_PASS: u32 = 4;

/// 16 entries in the digit table
pub const RADIX: u32 = 1 << BITS_PER_PASS;

/// 8 passes cover a 32 bit key
pub const NUM_PASSES: u32 = 32 / BITS_PER_PASS;

/// smallest subgroup width the subgroup scatter has to plan shared memory for
const MIN_SUBGROUP_SIZE: u32 = 4;

/// How the scatter phase obtains each element's local rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterKind {
    /// ranks are re-derived inside the scatter program; canonical form
    Fused,
    /// ranks are written once by the block phase to a per-element buffer and
    /// read back by a one-thread-per-element reorder program
    Separated,
}

struct StableBuffers {
    keys_a: wgpu::Buffer,
    keys_b: wgpu::Buffer,
    values_a: wgpu::Buffer,
    values_b: wgpu::Buffer,
    histogram: wgpu::Buffer,
    local_ranks: Option<wgpu::Buffer>,
    /// one bind group per pass, read/write pairs alternating with pass parity
    bind_groups: Vec<wgpu::BindGroup>,
    capacity: u32,
}

impl StableBuffers {
    fn destroy(&self) {
        self.keys_a.destroy();
        self.keys_b.destroy();
        self.values_a.destroy();
        self.values_b.destroy();
        self.histogram.destroy();
        if let Some(ranks) = &self.local_ranks {
            ranks.destroy();
        }
    }
}

/// Stable gpu radix sorter (radix 16, 8 passes).
pub struct StableSorter {
    scatter_kind: ScatterKind,
    use_subgroups: bool,
    bind_group_layout: wgpu::BindGroupLayout,
    block_p: wgpu::ComputePipeline,
    prefix_p: wgpu::ComputePipeline,
    scatter_p: wgpu::ComputePipeline,
    pass_uniforms: Vec<wgpu::Buffer>,
    buffers: Option<StableBuffers>,
}

impl StableSorter {
    /// Creates the pipelines for the requested scatter flavor.
    ///
    /// `prefer_subgroups` selects the subgroup-accelerated fused scatter; it
    /// is a strict optimization, so a device without
    /// [`wgpu::Features::SUBGROUP`] downgrades to the portable scatter with
    /// a warning instead of failing.
    ///
    /// The subgroup scatter additionally assumes that the device packs
    /// subgroups from consecutive local invocation indices in ascending
    /// order (see subgroup_scatter.wgsl). All targeted drivers do; on a
    /// device that maps subgroups differently its output is still a sorted
    /// permutation but equal keys may leave input order. When guaranteed
    /// stability matters more than throughput, pass `prefer_subgroups =
    /// false` and rely on the portable or separated scatter.
    pub fn new(device: &wgpu::Device, scatter_kind: ScatterKind, prefer_subgroups: bool) -> Self {
        let subgroups_supported = device.features().contains(wgpu::Features::SUBGROUP);
        if prefer_subgroups && !subgroups_supported {
            log::warn!(
                "subgroup scatter requested but the device does not expose {:?}, \
                 falling back to the portable scatter",
                wgpu::Features::SUBGROUP
            );
        }
        let use_subgroups =
            prefer_subgroups && subgroups_supported && scatter_kind == ScatterKind::Fused;

        let bind_group_layout = Self::bind_group_layout(device, scatter_kind);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("stable radix sort pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        // TODO replace with pipeline-overridable constants once naga accepts
        // them in array sizes
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
            include_str!("stable_sort.wgsl")
        )
        .replace("{wg_size}", WG_SIZE.to_string().as_str());

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("stable radix sort shader"),
            source: wgpu::ShaderSource::Wgsl(shader_code.into()),
        });

        let (block_entry, scatter_entry) = match scatter_kind {
            ScatterKind::Fused => ("histogram", "stable_scatter"),
            ScatterKind::Separated => ("block_sum", "reorder"),
        };

        let block_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("stable sort block phase"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: block_entry,
            compilation_options: Default::default(),
            cache: None,
        });
        let prefix_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("stable sort global prefix"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "prefix_sum",
            compilation_options: Default::default(),
            cache: None,
        });

        let scatter_p = if use_subgroups {
            // subgroups need their own module: `enable subgroups;` has to be
            // the first directive of the source
            let subgroup_code = format!(
                "enable subgroups;\n\
                const WG_SIZE: u32 = {:}u;\n\
                const ELEMENTS_PER_THREAD: u32 = {:}u;\n\
                const TILE_SIZE: u32 = {:}u;\n\
                const RADIX: u32 = {:}u;\n\
                const BITS_PER_PASS: u32 = {:}u;\n\
                const MAX_SUBGROUPS: u32 = {:}u;\n{:}",
                WG_SIZE,
                ELEMENTS_PER_THREAD,
                TILE_SIZE,
                RADIX,
                BITS_PER_PASS,
                WG_SIZE / MIN_SUBGROUP_SIZE,
                include_str!("subgroup_scatter.wgsl")
            )
            .replace("{wg_size}", WG_SIZE.to_string().as_str());
            let subgroup_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("stable radix sort subgroup scatter shader"),
                source: wgpu::ShaderSource::Wgsl(subgroup_code.into()),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("stable sort subgroup scatter"),
                layout: Some(&pipeline_layout),
                module: &subgroup_shader,
                entry_point: "stable_scatter_subgroup",
                compilation_options: Default::default(),
                cache: None,
            })
        } else {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("stable sort scatter"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: scatter_entry,
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let pass_uniforms = (0..NUM_PASSES)
            .map(|pass| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("stable sort pass {} uniform", pass)),
                    size: std::mem::size_of::<PassInfo>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        log::info!(
            "created stable sorter: {:?} scatter, subgroups {}",
            scatter_kind,
            if use_subgroups { "on" } else { "off" }
        );

        return Self {
            scatter_kind,
            use_subgroups,
            bind_group_layout,
            block_p,
            prefix_p,
            scatter_p,
            pass_uniforms,
            buffers: None,
        };
    }

    /// True when the subgroup scatter actually runs (after feature gating).
    pub fn uses_subgroups(&self) -> bool {
        self.use_subgroups
    }

    pub fn scatter_kind(&self) -> ScatterKind {
        self.scatter_kind
    }

    fn bind_group_layout(device: &wgpu::Device, scatter_kind: ScatterKind) -> wgpu::BindGroupLayout {
        let mut entries = vec![
            uniform_buffer_entry(0),
            storage_buffer_entry(1, true),
            storage_buffer_entry(2, true),
            storage_buffer_entry(3, false),
            storage_buffer_entry(4, false),
            storage_buffer_entry(5, false),
        ];
        if scatter_kind == ScatterKind::Separated {
            entries.push(storage_buffer_entry(6, false));
        }
        return device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("stable radix sort bind group layout"),
            entries: &entries,
        });
    }
}

impl Sorter for StableSorter {
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
                "growing stable sort buffers from {} to {} elements",
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
        let keys_a = primary("stable sort keys buffer");
        let values_a = primary("stable sort values buffer");
        let keys_b = aux("stable sort keys auxiliary buffer");
        let values_b = aux("stable sort values auxiliary buffer");

        let num_workgroups = padded / TILE_SIZE;
        let histogram = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("stable sort histogram buffer"),
            size: (RADIX * num_workgroups) as u64 * std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let local_ranks = match self.scatter_kind {
            ScatterKind::Fused => None,
            ScatterKind::Separated => Some(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("stable sort local rank buffer"),
                size: keyval_size,
                usage: wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            })),
        };

        let bind_groups = (0..NUM_PASSES)
            .map(|pass| {
                // even passes read the a pair and write the b pair
                let (read_keys, read_values, write_keys, write_values) = if pass % 2 == 0 {
                    (&keys_a, &values_a, &keys_b, &values_b)
                } else {
                    (&keys_b, &values_b, &keys_a, &values_a)
                };
                let mut entries = vec![
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
                ];
                if let Some(ranks) = &local_ranks {
                    entries.push(wgpu::BindGroupEntry {
                        binding: 6,
                        resource: ranks.as_entire_binding(),
                    });
                }
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("stable sort pass {} bind group", pass)),
                    layout: &self.bind_group_layout,
                    entries: &entries,
                })
            })
            .collect();

        self.buffers = Some(StableBuffers {
            keys_a,
            keys_b,
            values_a,
            values_b,
            histogram,
            local_ranks,
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
                    label: Some("stable sort block phase"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.block_p);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(num_workgroups, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some("stable sort global prefix"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.prefix_p);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(1, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some("stable sort scatter"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.scatter_p);
                pass.set_bind_group(0, bind_group, &[]);
                let scatter_workgroups = match self.scatter_kind {
                    ScatterKind::Fused => num_workgroups,
                    // the reorder program runs one thread per element
                    ScatterKind::Separated => num_elements.div_ceil(WG_SIZE),
                };
                pass.dispatch_workgroups(scatter_workgroups, 1, 1);
            }
        }

        // NUM_PASSES is even, the result is back in the a pair
        Ok(&buffers.values_a)
    }

    fn destroy(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            buffers.destroy();
        }
    }
}
