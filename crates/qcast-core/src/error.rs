//! Error type shared by every qcast crate.

use crate::DType;

/// Errors reported by qcast operations.
///
/// Every variant raised by a dispatch call carries the name of the failing
/// operation so a C caller reading `qcast_last_error()` can tell which entry
/// point rejected its request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QcastError {
    #[error("{op}: invalid argument: {msg}")]
    InvalidArgument { op: &'static str, msg: String },

    #[error("{op}: unsupported dtype combination {input} -> {output}")]
    UnsupportedDType {
        op: &'static str,
        input: DType,
        output: DType,
    },

    #[error("{op}: shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{op}: workspace too small: need {required} f32 elements, got {provided}")]
    MissingWorkspace {
        op: &'static str,
        required: usize,
        provided: usize,
    },

    #[error("{op}: device runtime failure: {msg}")]
    Runtime { op: &'static str, msg: String },

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl QcastError {
    /// Shorthand for an [`QcastError::InvalidArgument`].
    pub fn invalid(op: &'static str, msg: impl Into<String>) -> Self {
        QcastError::InvalidArgument {
            op,
            msg: msg.into(),
        }
    }

    /// Whether the error was raised by argument validation (no device work
    /// was enqueued).
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            QcastError::InvalidArgument { .. }
                | QcastError::UnsupportedDType { .. }
                | QcastError::ShapeMismatch { .. }
                | QcastError::MissingWorkspace { .. }
                | QcastError::Storage(_)
        )
    }

    /// Whether the error came from the device runtime.
    pub fn is_runtime(&self) -> bool {
        matches!(self, QcastError::Runtime { .. })
    }
}
