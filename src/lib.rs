#![doc = include_str!("../README.md")]
/*
    This crate implements the gpu depth-sorting engine of a Gaussian splat
    renderer: a stable, out-of-place radix sort over 32-bit key-value pairs,
    driven from the host as a sequence of compute dispatches.

    Three sorter implementations share one contract: a stable 16-radix gpu
    sort (the core), an unstable 256-radix gpu sort kept as a reference, and
    a cpu fallback that re-derives splat depths on the host.

    The stable shaders live in stable_sort.wgsl / subgroup_scatter.wgsl, the
    unstable ones in unstable_sort.wgsl.
*/

use std::fmt;

pub mod cpu;
pub mod stable;
pub mod unstable;
pub mod utils;

pub use cpu::CpuSorter;
pub use stable::{ScatterKind, StableSorter};
pub use unstable::UnstableSorter;

// IMPORTANT: the following constants have to be synced with the numbers in
// the wgsl sources (they are prepended to the shader text at pipeline
// creation).

/// workgroup size of every compute program
pub const WG_SIZE: u32 = 256;

/// keys read by one thread during one pass
pub const ELEMENTS_PER_THREAD: u32 = 16;

/// number of elements one workgroup owns during one pass
pub const TILE_SIZE: u32 = WG_SIZE * ELEMENTS_PER_THREAD;

/// Per-pass parameters, written to one small uniform buffer per pass before
/// any of the passes are encoded.
///
/// 16 bytes, little-endian; the shaders read the same layout.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
pub struct PassInfo {
    /// number of key-value pairs to sort
    pub num_elements: u32,
    /// first bit of the digit this pass sorts by
    pub bit_offset: u32,
    /// `ceil(num_elements / TILE_SIZE)`
    pub num_workgroups: u32,
    /// 1 for the first pass of a sort, 0 otherwise
    pub is_first_pass: u32,
}

/// Handles to the key/value input buffers of a sorter.
///
/// The upstream preprocess dispatch writes depth keys and splat indices into
/// these; they stay owned by the sorter and are valid until the next
/// [`Sorter::ensure_capacity`] call that actually grows the buffers.
pub struct InputBuffers<'a> {
    pub keys: &'a wgpu::Buffer,
    pub values: &'a wgpu::Buffer,
}

/// Errors reported by the sorters. Nothing is retried internally; every
/// condition surfaces to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SorterError {
    /// a call was made out of order or with arguments the current state
    /// cannot serve (e.g. `sort` with more elements than capacity)
    PreconditionViolated(String),
    /// the requested capacity exceeds what the device can allocate or
    /// dispatch
    ResourceExhausted(String),
}

impl fmt::Display for SorterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SorterError::PreconditionViolated(msg) => {
                write!(f, "precondition violated: {}", msg)
            }
            SorterError::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
        }
    }
}

impl std::error::Error for SorterError {}

/// The four-operation contract shared by all sorter implementations.
pub trait Sorter {
    /// Guarantees that subsequent [`Sorter::sort`] calls with
    /// `num_elements <= capacity` succeed without reallocation.
    ///
    /// Idempotent; capacity only grows. Growing destroys the old buffers, so
    /// previously returned [`InputBuffers`] handles become invalid.
    fn ensure_capacity(
        &mut self,
        device: &wgpu::Device,
        capacity: u32,
    ) -> Result<(), SorterError>;

    /// The key/value buffers the upstream preprocess stage writes into.
    fn input_buffers(&self) -> Result<InputBuffers<'_>, SorterError>;

    /// Encodes all sorting work into `encoder` and returns the buffer that
    /// will contain the sorted values once the encoder is submitted and the
    /// work completes. Does not wait or read back.
    ///
    /// Pass uniforms are written through `queue`, so the parameters apply to
    /// everything encoded against this sorter since the last submission;
    /// encode at most one `sort` per submission.
    ///
    /// `num_elements == 0` encodes nothing and returns a valid buffer.
    fn sort<'a>(
        &'a self,
        encoder: &mut wgpu::CommandEncoder,
        queue: &wgpu::Queue,
        num_elements: u32,
    ) -> Result<&'a wgpu::Buffer, SorterError>;

    /// Releases all owned buffers. Subsequent calls fail until
    /// [`Sorter::ensure_capacity`] re-creates them.
    fn destroy(&mut self);
}

/// Selects which sorter implementation [`build_sorter`] constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortVariant {
    /// host-side fallback, re-derives depths from splat positions
    Cpu,
    /// 256-radix gpu sort; fast but equal keys may reorder
    GpuUnstable,
    /// 16-radix stable gpu sort, shared-memory scatter only
    GpuStablePortable,
    /// 16-radix stable gpu sort with the subgroup-accelerated scatter;
    /// silently downgrades to the portable scatter if the device lacks
    /// subgroup support. Tie order additionally relies on the device packing
    /// subgroups in ascending local-invocation order, see
    /// [`StableSorter::new`].
    GpuStableSubgroup,
}

/// Constructs the sorter selected by `variant`.
pub fn build_sorter(device: &wgpu::Device, variant: SortVariant) -> Box<dyn Sorter> {
    match variant {
        SortVariant::Cpu => Box::new(CpuSorter::new()),
        SortVariant::GpuUnstable => Box::new(UnstableSorter::new(device)),
        SortVariant::GpuStablePortable => {
            Box::new(StableSorter::new(device, ScatterKind::Fused, false))
        }
        SortVariant::GpuStableSubgroup => {
            Box::new(StableSorter::new(device, ScatterKind::Fused, true))
        }
    }
}

pub(crate) fn uniform_buffer_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: std::num::NonZeroU64::new(std::mem::size_of::<PassInfo>() as u64),
        },
        count: None,
    }
}

pub(crate) fn storage_buffer_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// key/value buffers are padded to whole tiles; the padding is never read
pub(crate) fn padded_size(n: u32) -> u32 {
    n.max(1).div_ceil(TILE_SIZE) * TILE_SIZE
}

/// Rejects capacities the device cannot serve before anything is allocated.
pub(crate) fn check_device_limits(
    device: &wgpu::Device,
    padded: u32,
) -> Result<(), SorterError> {
    let limits = device.limits();
    let bytes = padded as u64 * std::mem::size_of::<u32>() as u64;
    if bytes > limits.max_storage_buffer_binding_size as u64 || bytes > limits.max_buffer_size {
        return Err(SorterError::ResourceExhausted(format!(
            "a {} byte key buffer exceeds the device storage buffer limits",
            bytes
        )));
    }
    let num_workgroups = padded / TILE_SIZE;
    if num_workgroups > limits.max_compute_workgroups_per_dimension {
        return Err(SorterError::ResourceExhausted(format!(
            "{} workgroups exceed the device dispatch limit of {}",
            num_workgroups, limits.max_compute_workgroups_per_dimension
        )));
    }
    Ok(())
}
