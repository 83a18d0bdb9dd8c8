//! # qcast-capi
//!
//! C ABI over the process-wide host engine. Objects cross the boundary as
//! tagged 64-bit handles; every function returns a [`QcastStatus`] and
//! leaves a message for [`qcast_last_error`] on failure.
//!
//! ## C usage
//! ```c
//! #include "qcast.h"
//!
//! size_t shape[2] = {128, 256};
//! QcastTensor x, q;
//! qcast_tensor_create(shape, 2, QCAST_DTYPE_BF16, QCAST_SCALING_TENSOR, &x);
//! qcast_tensor_create(shape, 2, QCAST_DTYPE_FP8_E4M3, QCAST_SCALING_TENSOR, &q);
//! qcast_tensor_write(x, data, 128 * 256);
//! qcast_tensor_set_scale(q, 2.0f);
//!
//! QcastStream s = qcast_stream_default();
//! if (qcast_quantize(x, q, s) != QCAST_OK) {
//!     fprintf(stderr, "%s\n", qcast_last_error());
//! }
//! qcast_stream_synchronize(s);
//!
//! qcast_tensor_destroy(q);
//! qcast_tensor_destroy(x);
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod ops;
pub mod stream;
pub mod tensor;

pub use config::QcastQuantizationConfig;
pub use error::{qcast_last_error, QcastStatus};
pub use stream::{QcastStream, QCAST_DEFAULT_STREAM};
pub use tensor::QcastTensor;
