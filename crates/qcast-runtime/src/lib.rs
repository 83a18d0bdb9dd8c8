//! # qcast-runtime
//!
//! Device runtimes and the quantization dispatch engine.
//!
//! - [`DeviceRuntime`]: streams, events and kernel launches on one device
//! - [`HostRuntime`]: worker-thread streams running the reference kernels
//! - [`StreamPool`]: auxiliary compute streams for multi-tensor fan-out
//! - [`Engine`]: validating entry points for every quantize/dequantize op
//! - `CudaRuntime` (feature `cuda`): NVRTC-compiled kernels via cudarc

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod host;
pub mod pool;
pub mod runtime;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use config::RuntimeConfig;
pub use device::{DeviceInfo, DeviceProperties, KernelTuning};
pub use dispatch::Engine;
pub use error::RuntimeError;
pub use global::HostEngine;
pub use host::{HostEvent, HostRuntime, HostStream};
pub use pool::StreamPool;
pub use runtime::{CastLaunch, DbiasTarget, DequantizeLaunch, DeviceRuntime, KernelLaunch};

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;
