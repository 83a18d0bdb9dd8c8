//! Launch glue for the cast and dequantize kernels.
//!
//! Arguments follow the parameter lists in `kernels/cast.cu` one to one.
//! Optional buffers are replaced by a per-device dummy allocation and gated
//! by a `has_*` flag, so the kernel never dereferences them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaContext, CudaSlice, CudaStream, PushKernelArg};
use parking_lot::{Mutex, MutexGuard};

use qcast_core::{Storage, Tensor};
use qcast_kernels::{workspace_shape, CHUNK_ROWS};

use super::launch::{get_or_load_func, grid_1d, grid_cols_chunks};
use crate::device::KernelTuning;
use crate::error::RuntimeError;
use crate::runtime::{CastLaunch, DequantizeLaunch};

const CAST_CU: &str = include_str!("kernels/cast.cu");
const MODULE: &str = "qcast_cast";

static DUMMY_BUFS: OnceLock<Mutex<HashMap<usize, Arc<CudaSlice<u8>>>>> = OnceLock::new();

fn dummy_buf(stream: &Arc<CudaStream>, ordinal: usize) -> Result<Arc<CudaSlice<u8>>, RuntimeError> {
    let mut map = DUMMY_BUFS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(buf) = map.get(&ordinal) {
        return Ok(Arc::clone(buf));
    }
    let buf = Arc::new(stream.alloc_zeros::<u8>(4).map_err(|e| RuntimeError::Driver {
        op: "cuMemAlloc",
        msg: e.to_string(),
    })?);
    map.insert(ordinal, Arc::clone(&buf));
    Ok(buf)
}

fn lock_buffer<'a>(s: &'a Storage, what: &str) -> Result<MutexGuard<'a, CudaSlice<u8>>, RuntimeError> {
    s.cuda_buffer()
        .map(|m| m.lock())
        .ok_or_else(|| RuntimeError::Driver {
            op: "kernel_launch",
            msg: format!("{what} is not a CUDA buffer"),
        })
}

fn lock_opt<'a>(
    s: Option<&'a Storage>,
    what: &str,
) -> Result<Option<MutexGuard<'a, CudaSlice<u8>>>, RuntimeError> {
    s.map(|s| lock_buffer(s, what)).transpose()
}

fn launch_err(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Driver {
        op: "cuLaunchKernel",
        msg: e.to_string(),
    }
}

/// Enqueue a fused cast (and the dbias reduction when fused) on `stream`.
///
/// The caller serializes launches, so the operand locks taken here never
/// contend with another launch.
pub fn launch_cast(
    ctx: &Arc<CudaContext>,
    stream: &Arc<CudaStream>,
    ordinal: usize,
    tuning: KernelTuning,
    l: &CastLaunch,
) -> Result<(), RuntimeError> {
    let (rows, cols) = l.input.shape().flat_2d();
    if rows * cols == 0 {
        return Ok(());
    }
    let func = get_or_load_func(ctx, ordinal, MODULE, l.variant.cuda_entry(), CAST_CU)?;
    let dummy = dummy_buf(stream, ordinal)?;

    let fp8_out = l.output.dtype().is_fp8();
    let scale = if fp8_out { l.output.scale() } else { None };
    let amax = if fp8_out { l.output.amax() } else { None };
    let scale_inv = if fp8_out { l.output.scale_inv() } else { None };

    let input = lock_buffer(l.input.storage(), "input")?;
    let act_input = lock_opt(l.act_input.as_ref().map(Tensor::storage), "activation input")?;
    let output = lock_buffer(l.output.storage(), "output")?;
    let scale_g = lock_opt(scale, "scale")?;
    let amax_g = lock_opt(amax, "amax")?;
    let scale_inv_g = lock_opt(scale_inv, "scale_inv")?;
    let workspace_g = lock_opt(l.dbias.as_ref().map(|d| d.workspace.storage()), "workspace")?;
    let noop_g = lock_opt(l.noop.as_ref().map(Tensor::storage), "noop")?;

    let in_dtype = l.input.dtype().code();
    let out_dtype = l.output.dtype().code();
    let (rows_u, cols_u) = (rows as u32, cols as u32);
    let has_scale = scale_g.is_some() as u32;
    let has_amax = amax_g.is_some() as u32;
    let has_scale_inv = scale_inv_g.is_some() as u32;
    let has_noop = noop_g.is_some() as u32;

    let cfg = grid_cols_chunks(rows, cols, tuning.threads_per_block, CHUNK_ROWS);
    let mut b = stream.launch_builder(&func);
    b.arg(&*input);
    b.arg(&in_dtype);
    b.arg(act_input.as_deref().unwrap_or(&dummy));
    b.arg(&*output);
    b.arg(&out_dtype);
    b.arg(scale_g.as_deref().unwrap_or(&dummy));
    b.arg(amax_g.as_deref().unwrap_or(&dummy));
    b.arg(scale_inv_g.as_deref().unwrap_or(&dummy));
    b.arg(workspace_g.as_deref().unwrap_or(&dummy));
    b.arg(noop_g.as_deref().unwrap_or(&dummy));
    b.arg(&rows_u);
    b.arg(&cols_u);
    b.arg(&has_scale);
    b.arg(&has_amax);
    b.arg(&has_scale_inv);
    b.arg(&has_noop);
    unsafe { b.launch(cfg) }.map_err(launch_err)?;

    if let (Some(target), Some(workspace)) = (&l.dbias, workspace_g.as_deref()) {
        let reduce = get_or_load_func(ctx, ordinal, MODULE, "qcast_reduce_dbias", CAST_CU)?;
        let dbias = lock_buffer(target.dbias.storage(), "dbias")?;
        let dbias_dtype = target.dbias.dtype().code();
        let partial_rows = workspace_shape(rows, cols).0 as u32;
        let mut b = stream.launch_builder(&reduce);
        b.arg(workspace);
        b.arg(&*dbias);
        b.arg(&dbias_dtype);
        b.arg(&partial_rows);
        b.arg(&cols_u);
        b.arg(noop_g.as_deref().unwrap_or(&dummy));
        b.arg(&has_noop);
        unsafe { b.launch(grid_1d(cols, tuning.threads_per_block)) }.map_err(launch_err)?;
    }
    Ok(())
}

pub fn launch_dequantize(
    ctx: &Arc<CudaContext>,
    stream: &Arc<CudaStream>,
    ordinal: usize,
    tuning: KernelTuning,
    l: &DequantizeLaunch,
) -> Result<(), RuntimeError> {
    let n = l.input.numel();
    if n == 0 {
        return Ok(());
    }
    let func = get_or_load_func(ctx, ordinal, MODULE, "qcast_dequantize", CAST_CU)?;
    let input = lock_buffer(l.input.storage(), "input")?;
    let output = lock_buffer(l.output.storage(), "output")?;
    let scale_inv = lock_opt(l.input.scale_inv(), "scale_inv")?.ok_or_else(|| RuntimeError::Driver {
        op: "kernel_launch",
        msg: "quantized input has no scale_inv".into(),
    })?;
    let in_dtype = l.input.dtype().code();
    let out_dtype = l.output.dtype().code();
    let n_u = n as u32;

    let mut b = stream.launch_builder(&func);
    b.arg(&*input);
    b.arg(&in_dtype);
    b.arg(&*output);
    b.arg(&out_dtype);
    b.arg(&*scale_inv);
    b.arg(&n_u);
    unsafe { b.launch(grid_1d(n, tuning.threads_per_block)) }.map_err(launch_err)?;
    Ok(())
}
