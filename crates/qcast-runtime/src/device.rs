//! Device capability provider.

use serde::Serialize;

/// Properties of the device a runtime drives.
pub trait DeviceProperties: Send + Sync {
    fn num_devices(&self) -> usize;

    fn current_device(&self) -> usize;

    /// Compute capability as `major * 10 + minor`.
    fn sm_arch(&self) -> u32;

    fn sm_count(&self) -> usize;

    /// `(least, greatest)` stream priority. As on CUDA, a numerically lower
    /// value is a higher priority.
    fn stream_priority_range(&self) -> (i32, i32);

    fn supports_multicast(&self) -> bool;
}

/// Snapshot of a device's properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub runtime: String,
    pub num_devices: usize,
    pub current_device: usize,
    pub sm_arch: u32,
    pub sm_count: usize,
    pub stream_priority_range: (i32, i32),
    pub supports_multicast: bool,
}

impl DeviceInfo {
    pub fn query(runtime: &str, props: &dyn DeviceProperties) -> Self {
        Self {
            runtime: runtime.to_string(),
            num_devices: props.num_devices(),
            current_device: props.current_device(),
            sm_arch: props.sm_arch(),
            sm_count: props.sm_count(),
            stream_priority_range: props.stream_priority_range(),
            supports_multicast: props.supports_multicast(),
        }
    }
}

/// Launch parameters derived from device properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelTuning {
    /// Threads per block of the cast kernels (one thread per column).
    pub threads_per_block: u32,
    /// Upper bound on resident blocks, used to cap reduction grids.
    pub max_resident_blocks: u32,
}

impl KernelTuning {
    pub fn for_device(props: &dyn DeviceProperties) -> Self {
        let threads_per_block = if props.sm_arch() >= 90 { 256 } else { 128 };
        let blocks_per_sm = if props.sm_arch() >= 80 { 8 } else { 4 };
        Self {
            threads_per_block,
            max_resident_blocks: (props.sm_count() as u32).max(1) * blocks_per_sm,
        }
    }
}
