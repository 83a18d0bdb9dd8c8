use qcast_core::QcastError;

/// Failures raised by a device runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("device runtime not available: {0}")]
    NotAvailable(String),

    #[error("device init failed: {0}")]
    DeviceInit(String),

    #[error("{op} failed: {msg}")]
    Driver { op: &'static str, msg: String },

    #[error("stream {0} has been destroyed")]
    StreamDestroyed(u64),

    #[error("event {0} has been destroyed")]
    EventDestroyed(u64),

    #[error("stream poisoned by failed kernel {op}: {msg}")]
    Poisoned { op: String, msg: String },

    #[error("PTX compilation failed for module '{module}': {msg}")]
    PtxCompile { module: String, msg: String },

    #[error("function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("compute stream pool has been shut down")]
    PoolShutDown,
}

impl RuntimeError {
    /// Attach the name of the operation that hit this failure.
    pub fn into_qcast(self, op: &'static str) -> QcastError {
        QcastError::Runtime {
            op,
            msg: self.to_string(),
        }
    }
}

impl From<RuntimeError> for QcastError {
    fn from(e: RuntimeError) -> Self {
        e.into_qcast("device_runtime")
    }
}
