//! Status codes and the per-thread last error.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::debug;

use qcast_core::{QcastError, Result};

/// Result of every C entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QcastStatus {
    Ok = 0,
    InvalidArgument = 1,
    RuntimeError = 2,
    InvalidHandle = 3,
}

impl From<&QcastError> for QcastStatus {
    fn from(e: &QcastError) -> Self {
        match e {
            QcastError::InvalidHandle(_) => QcastStatus::InvalidHandle,
            e if e.is_runtime() => QcastStatus::RuntimeError,
            _ => QcastStatus::InvalidArgument,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    let msg = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(msg));
}

/// Run an entry point body, turning its error or panic into a status.
pub(crate) fn run(op: &'static str, f: impl FnOnce() -> Result<()>) -> QcastStatus {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => QcastStatus::Ok,
        Ok(Err(e)) => {
            debug!(op, error = %e, "C call failed");
            set_last_error(&e.to_string());
            QcastStatus::from(&e)
        }
        Err(_) => {
            set_last_error(&format!("{op}: internal panic"));
            QcastStatus::RuntimeError
        }
    }
}

pub(crate) unsafe fn slice_arg<'a, T>(
    op: &'static str,
    what: &str,
    ptr: *const T,
    len: usize,
) -> Result<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(QcastError::invalid(op, format!("{what} is null")));
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

pub(crate) unsafe fn out_arg<'a, T>(op: &'static str, what: &str, ptr: *mut T) -> Result<&'a mut T> {
    ptr.as_mut()
        .ok_or_else(|| QcastError::invalid(op, format!("{what} is null")))
}

/// Message of the last failed call on this thread, or null. The pointer
/// stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn qcast_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            QcastStatus::from(&QcastError::invalid("quantize", "bad")),
            QcastStatus::InvalidArgument
        );
        assert_eq!(
            QcastStatus::from(&QcastError::Runtime {
                op: "quantize",
                msg: "boom".into()
            }),
            QcastStatus::RuntimeError
        );
        assert_eq!(
            QcastStatus::from(&QcastError::InvalidHandle("0x1".into())),
            QcastStatus::InvalidHandle
        );
    }

    #[test]
    fn test_run_records_last_error() {
        let status = run("qcast_test", || Err(QcastError::invalid("qcast_test", "nope")));
        assert_eq!(status, QcastStatus::InvalidArgument);
        let msg = unsafe { CStr::from_ptr(qcast_last_error()) }.to_str().unwrap().to_owned();
        assert!(msg.contains("qcast_test") && msg.contains("nope"));

        assert_eq!(run("qcast_test", || panic!("x")), QcastStatus::RuntimeError);
        assert_eq!(run("qcast_test", || Ok(())), QcastStatus::Ok);
    }
}
