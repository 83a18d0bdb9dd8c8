//! Tensor handles.
//!
//! Reads and writes are immediate host copies; synchronize the stream that
//! produced a tensor before reading it.

use std::sync::OnceLock;

use qcast_core::{DType, QcastError, Result, ScalingMode, Tensor};

use crate::error::{out_arg, run, slice_arg, QcastStatus};
use crate::handle::{Handle, HandleKind, Registry};

pub type QcastTensor = Handle;

pub(crate) fn tensors() -> &'static Registry<Tensor> {
    static TENSORS: OnceLock<Registry<Tensor>> = OnceLock::new();
    TENSORS.get_or_init(|| Registry::new(HandleKind::Tensor))
}

pub(crate) fn tensor(handle: QcastTensor) -> Result<Tensor> {
    tensors().get(handle)
}

/// Allocate a zeroed tensor. FP8 tensors get every scaling buffer their
/// mode needs (tensor mode starts at scale 1, amax 0).
///
/// # Safety
/// `shape` must point to `ndim` values and `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_create(
    shape: *const usize,
    ndim: usize,
    dtype: i32,
    scaling_mode: i32,
    out: *mut QcastTensor,
) -> QcastStatus {
    const OP: &str = "qcast_tensor_create";
    run(OP, || {
        let out = out_arg(OP, "out", out)?;
        let dims = slice_arg(OP, "shape", shape, ndim)?;
        let dtype = DType::from_code(dtype)
            .ok_or_else(|| QcastError::invalid(OP, format!("unknown dtype code {dtype}")))?;
        let mode = ScalingMode::from_code(scaling_mode)
            .ok_or_else(|| QcastError::invalid(OP, format!("unknown scaling mode {scaling_mode}")))?;
        let t = if dtype.is_fp8() {
            Tensor::quantized(dims, dtype, mode)?
        } else {
            Tensor::zeros(dims, dtype)
        };
        *out = tensors().insert(t);
        Ok(())
    })
}

/// Overwrite the tensor with `n` values encoded in its dtype.
///
/// # Safety
/// `data` must point to `n` floats.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_write(t: QcastTensor, data: *const f32, n: usize) -> QcastStatus {
    const OP: &str = "qcast_tensor_write";
    run(OP, || {
        let t = tensor(t)?;
        let values = slice_arg(OP, "data", data, n)?;
        t.storage().write_f32(values)
    })
}

/// Decode the tensor into `n` floats (no scale applied).
///
/// # Safety
/// `out` must point to `n` writable floats.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_read(t: QcastTensor, out: *mut f32, n: usize) -> QcastStatus {
    const OP: &str = "qcast_tensor_read";
    run(OP, || {
        let values = tensor(t)?.to_f32_vec()?;
        if values.len() != n {
            return Err(QcastError::invalid(OP, format!("tensor holds {} values, buffer {n}", values.len())));
        }
        if n > 0 {
            if out.is_null() {
                return Err(QcastError::invalid(OP, "out is null"));
            }
            std::slice::from_raw_parts_mut(out, n).copy_from_slice(&values);
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn qcast_tensor_set_scale(t: QcastTensor, scale: f32) -> QcastStatus {
    run("qcast_tensor_set_scale", || {
        tensors().update(t, |entry| {
            *entry = entry.clone().with_scale(scale)?;
            Ok(())
        })
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_amax(t: QcastTensor, out: *mut f32) -> QcastStatus {
    const OP: &str = "qcast_tensor_amax";
    run(OP, || {
        let out = out_arg(OP, "out", out)?;
        *out = tensor(t)?.amax_value()?;
        Ok(())
    })
}

/// Decoded dequantization factors; `n` must equal their count.
///
/// # Safety
/// `out` must point to `n` writable floats.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_scale_inv(t: QcastTensor, out: *mut f32, n: usize) -> QcastStatus {
    const OP: &str = "qcast_tensor_scale_inv";
    run(OP, || {
        let values = tensor(t)?.scale_inv_values()?;
        if values.len() != n || out.is_null() {
            return Err(QcastError::invalid(
                OP,
                format!("tensor has {} scale_inv factors, buffer {n}", values.len()),
            ));
        }
        std::slice::from_raw_parts_mut(out, n).copy_from_slice(&values);
        Ok(())
    })
}

/// Attach zeroed columnwise data and `scale_inv` buffers to an FP8 tensor;
/// quantizing into it then fills both copies.
#[no_mangle]
pub extern "C" fn qcast_tensor_enable_columnwise(t: QcastTensor) -> QcastStatus {
    run("qcast_tensor_enable_columnwise", || {
        tensors().update(t, |entry| {
            if !entry.has_columnwise() {
                *entry = entry.clone().with_columnwise()?;
            }
            Ok(())
        })
    })
}

/// Decoded columnwise dequantization factors; `n` must equal their count.
///
/// # Safety
/// `out` must point to `n` writable floats.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_columnwise_scale_inv(t: QcastTensor, out: *mut f32, n: usize) -> QcastStatus {
    const OP: &str = "qcast_tensor_columnwise_scale_inv";
    run(OP, || {
        let values = tensor(t)?.columnwise_scale_inv_values()?;
        if values.len() != n || out.is_null() {
            return Err(QcastError::invalid(
                OP,
                format!("tensor has {} columnwise scale_inv factors, buffer {n}", values.len()),
            ));
        }
        std::slice::from_raw_parts_mut(out, n).copy_from_slice(&values);
        Ok(())
    })
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_tensor_numel(t: QcastTensor, out: *mut usize) -> QcastStatus {
    const OP: &str = "qcast_tensor_numel";
    run(OP, || {
        let out = out_arg(OP, "out", out)?;
        *out = tensor(t)?.numel();
        Ok(())
    })
}

/// Release the handle. Work already enqueued keeps the buffer alive.
#[no_mangle]
pub extern "C" fn qcast_tensor_destroy(t: QcastTensor) -> QcastStatus {
    run("qcast_tensor_destroy", || tensors().remove(t).map(|_| ()))
}
