//! Stream handles.

use std::sync::{Arc, OnceLock};

use qcast_core::Result;
use qcast_runtime::{global, DeviceRuntime, HostEngine, HostStream};

use crate::error::{out_arg, run, QcastStatus};
use crate::handle::{make_handle, Handle, HandleKind, Registry};

pub type QcastStream = Handle;

/// The engine's default stream, resolved at call time.
pub const QCAST_DEFAULT_STREAM: QcastStream = make_handle(HandleKind::Stream, 0);

fn streams() -> &'static Registry<HostStream> {
    static STREAMS: OnceLock<Registry<HostStream>> = OnceLock::new();
    STREAMS.get_or_init(|| Registry::new(HandleKind::Stream))
}

/// Resolve `handle` against the current process-wide engine.
pub(crate) fn resolve(handle: QcastStream) -> Result<(Arc<HostEngine>, HostStream)> {
    let registry = streams();
    let id = registry.id_of(handle)?;
    let engine = global::engine()?;
    let stream = if id == 0 {
        engine.runtime().default_stream()
    } else {
        registry.get(handle)?
    };
    Ok((engine, stream))
}

#[no_mangle]
pub extern "C" fn qcast_stream_default() -> QcastStream {
    QCAST_DEFAULT_STREAM
}

/// Create a stream. Priorities outside the device range are clamped.
///
/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_stream_create(priority: i32, out: *mut QcastStream) -> QcastStatus {
    const OP: &str = "qcast_stream_create";
    run(OP, || {
        let out = out_arg(OP, "out", out)?;
        let stream = global::engine()?.runtime().create_stream(Some(priority))?;
        *out = streams().insert(stream);
        Ok(())
    })
}

/// Block until everything enqueued on the stream has run.
#[no_mangle]
pub extern "C" fn qcast_stream_synchronize(stream: QcastStream) -> QcastStatus {
    const OP: &str = "qcast_stream_synchronize";
    run(OP, || {
        let (engine, stream) = resolve(stream)?;
        engine
            .runtime()
            .synchronize(&stream)
            .map_err(|e| e.into_qcast(OP))
    })
}

/// Destroy a created stream after draining it. The default stream cannot
/// be destroyed.
#[no_mangle]
pub extern "C" fn qcast_stream_destroy(stream: QcastStream) -> QcastStatus {
    const OP: &str = "qcast_stream_destroy";
    run(OP, || {
        let s = streams().remove(stream)?;
        global::engine()?
            .runtime()
            .destroy_stream(&s)
            .map_err(|e| e.into_qcast(OP))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stream_is_not_destroyable() {
        assert_eq!(qcast_stream_synchronize(qcast_stream_default()), QcastStatus::Ok);
        assert_eq!(
            qcast_stream_destroy(qcast_stream_default()),
            QcastStatus::InvalidHandle
        );
    }

    #[test]
    fn test_create_sync_destroy() {
        let mut s = 0;
        assert_eq!(unsafe { qcast_stream_create(-100, &mut s) }, QcastStatus::Ok);
        assert_ne!(s, QCAST_DEFAULT_STREAM);
        assert_eq!(qcast_stream_synchronize(s), QcastStatus::Ok);
        assert_eq!(qcast_stream_destroy(s), QcastStatus::Ok);
        assert_eq!(qcast_stream_synchronize(s), QcastStatus::InvalidHandle);
    }
}
