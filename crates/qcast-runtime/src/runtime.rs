//! The device runtime contract.
//!
//! Everything the dispatch engine and the stream pool need from a device:
//! ordered streams, events with record/wait semantics, and asynchronous
//! kernel launches. Every call returns once the work is enqueued; only
//! [`DeviceRuntime::synchronize`] blocks the host.

use std::fmt;

use qcast_core::{Device, Tensor};
use qcast_kernels::KernelVariant;

use crate::device::DeviceProperties;
use crate::error::RuntimeError;

/// Bias-gradient outputs of a dbias launch.
#[derive(Debug, Clone)]
pub struct DbiasTarget {
    pub dbias: Tensor,
    /// F32 scratch sized by the workspace query.
    pub workspace: Tensor,
}

/// A fused cast ready to run.
#[derive(Debug, Clone)]
pub struct CastLaunch {
    pub variant: KernelVariant,
    pub input: Tensor,
    pub act_input: Option<Tensor>,
    pub output: Tensor,
    pub dbias: Option<DbiasTarget>,
    pub noop: Option<Tensor>,
    pub force_pow_2_scales: bool,
    pub amax_epsilon: f32,
}

#[derive(Debug, Clone)]
pub struct DequantizeLaunch {
    pub input: Tensor,
    pub output: Tensor,
    /// Read the input's columnwise copy instead of its rowwise data.
    pub columnwise: bool,
}

/// One kernel launch, with every operand already validated.
#[derive(Debug, Clone)]
pub enum KernelLaunch {
    Cast(CastLaunch),
    Dequantize(DequantizeLaunch),
}

impl KernelLaunch {
    /// Kernel name for logs and error reports.
    pub fn name(&self) -> String {
        match self {
            KernelLaunch::Cast(c) => c.variant.to_string(),
            KernelLaunch::Dequantize(d) if d.columnwise => "dequantize_columnwise".to_string(),
            KernelLaunch::Dequantize(_) => "dequantize".to_string(),
        }
    }
}

impl fmt::Display for KernelLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// An execution target for qcast kernels.
pub trait DeviceRuntime: Send + Sync + 'static {
    type Stream: Clone + Send + Sync + fmt::Debug + 'static;
    type Event: Clone + Send + Sync + fmt::Debug + 'static;

    /// Short name ("host", "cuda").
    fn name(&self) -> &'static str;

    /// Device every tensor handed to this runtime must live on.
    fn device(&self) -> Device;

    fn properties(&self) -> &dyn DeviceProperties;

    fn default_stream(&self) -> Self::Stream;

    /// New stream; `priority` follows the device's priority range.
    fn create_stream(&self, priority: Option<i32>) -> Result<Self::Stream, RuntimeError>;

    fn create_event(&self) -> Result<Self::Event, RuntimeError>;

    /// Enqueue a record of `event` on `stream`.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<(), RuntimeError>;

    /// Make `stream` wait for the most recent record of `event` enqueued so
    /// far. Waiting on a never-recorded event is a no-op.
    fn stream_wait_event(&self, stream: &Self::Stream, event: &Self::Event)
        -> Result<(), RuntimeError>;

    /// Block the host until `stream` drains.
    fn synchronize(&self, stream: &Self::Stream) -> Result<(), RuntimeError>;

    fn destroy_stream(&self, stream: &Self::Stream) -> Result<(), RuntimeError>;

    fn destroy_event(&self, event: &Self::Event) -> Result<(), RuntimeError>;

    /// Whether this runtime can execute `launch`; checked before enqueue.
    fn supports(&self, launch: &KernelLaunch) -> Result<(), String> {
        let _ = launch;
        Ok(())
    }

    /// Enqueue a kernel on `stream`.
    fn launch(&self, stream: &Self::Stream, launch: KernelLaunch) -> Result<(), RuntimeError>;
}
