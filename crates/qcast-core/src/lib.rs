//! # qcast-core
//!
//! Data model shared by the qcast crates.
//!
//! Provides:
//! - `DType` covering the high-precision and FP8 formats
//! - Reference-counted device `Storage` and `Tensor` handles
//! - Scaling modes and the block scale formula
//! - Float-format codecs (`half`, `float8`, E8M0)

pub mod dtype;
pub mod device;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod scaling;
pub mod config;
pub mod format;
pub mod error;

pub use dtype::DType;
pub use device::Device;
pub use storage::Storage;
pub use shape::Shape;
pub use tensor::Tensor;
pub use scaling::ScalingMode;
pub use config::QuantizationConfig;
pub use error::QcastError;

pub type Result<T> = std::result::Result<T, QcastError>;
