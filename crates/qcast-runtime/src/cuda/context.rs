//! CUDA context management.
//!
//! One lazily created `CudaContext` per GPU ordinal, shared by every
//! runtime bound to that device.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{sys, CudaContext};
use parking_lot::Mutex;

use crate::error::RuntimeError;

static CONTEXTS: OnceLock<Mutex<HashMap<usize, Arc<CudaContext>>>> = OnceLock::new();

fn contexts() -> &'static Mutex<HashMap<usize, Arc<CudaContext>>> {
    CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the context for GPU `ordinal`.
pub fn get_context(ordinal: usize) -> Result<Arc<CudaContext>, RuntimeError> {
    let mut map = contexts().lock();
    if let Some(ctx) = map.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }
    let ctx = CudaContext::new(ordinal)
        .map_err(|e| RuntimeError::DeviceInit(format!("device {ordinal}: {e}")))?;
    // ordering across streams is expressed with explicit events
    unsafe { ctx.disable_event_tracking() };
    map.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

pub fn device_count() -> usize {
    CudaContext::device_count().map_or(0, |n| n.max(0) as usize)
}

pub fn is_cuda_available() -> bool {
    device_count() > 0
}

/// Integer device attribute.
pub fn attribute(ctx: &CudaContext, attr: sys::CUdevice_attribute) -> Result<i32, RuntimeError> {
    ctx.attribute(attr).map_err(|e| RuntimeError::Driver {
        op: "cuDeviceGetAttribute",
        msg: e.to_string(),
    })
}

/// `(least, greatest)` stream priorities of `ctx`'s device; numerically
/// lower is higher priority.
pub fn stream_priority_range(ctx: &CudaContext) -> Result<(i32, i32), RuntimeError> {
    let err = |e: cudarc::driver::DriverError| RuntimeError::Driver {
        op: "cuCtxGetStreamPriorityRange",
        msg: e.to_string(),
    };
    ctx.bind_to_thread().map_err(err)?;
    let (mut least, mut greatest) = (0i32, 0i32);
    unsafe { sys::cuCtxGetStreamPriorityRange(&mut least, &mut greatest) }
        .result()
        .map_err(err)?;
    Ok((least, greatest))
}
