//! Device capability queries and engine teardown.

use qcast_runtime::{global, DeviceInfo};

use crate::error::{out_arg, run, QcastStatus};

fn query<T>(op: &'static str, out: *mut T, f: impl FnOnce(&DeviceInfo) -> T) -> QcastStatus {
    run(op, || {
        let out = unsafe { out_arg(op, "out", out)? };
        *out = f(&global::engine()?.device_info());
        Ok(())
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_num_devices(out: *mut usize) -> QcastStatus {
    query("qcast_num_devices", out, |d| d.num_devices)
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_current_device(out: *mut usize) -> QcastStatus {
    query("qcast_current_device", out, |d| d.current_device)
}

/// Compute capability as `major * 10 + minor`.
///
/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_sm_arch(out: *mut u32) -> QcastStatus {
    query("qcast_sm_arch", out, |d| d.sm_arch)
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_sm_count(out: *mut usize) -> QcastStatus {
    query("qcast_sm_count", out, |d| d.sm_count)
}

/// # Safety
/// `least` and `greatest` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_stream_priority_range(least: *mut i32, greatest: *mut i32) -> QcastStatus {
    const OP: &str = "qcast_stream_priority_range";
    run(OP, || {
        let least = out_arg(OP, "least", least)?;
        let greatest = out_arg(OP, "greatest", greatest)?;
        (*least, *greatest) = global::engine()?.device_info().stream_priority_range;
        Ok(())
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_supports_multicast(out: *mut bool) -> QcastStatus {
    query("qcast_supports_multicast", out, |d| d.supports_multicast)
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_num_compute_streams(out: *mut usize) -> QcastStatus {
    const OP: &str = "qcast_num_compute_streams";
    run(OP, || {
        let out = out_arg(OP, "out", out)?;
        *out = global::engine()?.num_compute_streams();
        Ok(())
    })
}

/// Drain and release the compute stream pool and drop the process-wide
/// engine. The next call builds a fresh one.
#[no_mangle]
pub extern "C" fn qcast_shutdown() -> QcastStatus {
    run("qcast_shutdown", global::shutdown)
}
