//! # qcast-kernels
//!
//! Fused cast kernels and the variant table that selects them.
//!
//! Provides:
//! - Activation functions and derivatives as zero-sized types
//! - Fusion shapes resolved to a closed set of kernel variants
//! - Host reference kernels (fused cast, dbias reduction, dequantize)

pub mod activation;
pub mod fusion;
pub mod quantize;
pub mod dbias;
pub mod dequantize;

/// Rows handled by one parallel work item of a host kernel, and the row
/// count behind one dbias workspace row.
pub const CHUNK_ROWS: usize = 128;

pub use activation::{Activation, ActivationKind};
pub use fusion::{FusionShape, KernelVariant};
pub use quantize::{CastInputs, CastOutputs, ColumnwiseOutputs, DbiasOutputs, HostKernelFn, QuantScaling};
pub use dequantize::DequantInputs;
pub use dbias::workspace_shape;
