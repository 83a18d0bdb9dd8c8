//! Quantization config handles.

use std::sync::OnceLock;

use qcast_core::{QuantizationConfig, Result};

use crate::error::{out_arg, run, QcastStatus};
use crate::handle::{Handle, HandleKind, Registry};
use crate::tensor::{tensor, QcastTensor};

pub type QcastQuantizationConfig = Handle;

fn configs() -> &'static Registry<QuantizationConfig> {
    static CONFIGS: OnceLock<Registry<QuantizationConfig>> = OnceLock::new();
    CONFIGS.get_or_init(|| Registry::new(HandleKind::Config))
}

pub(crate) fn config(handle: QcastQuantizationConfig) -> Result<QuantizationConfig> {
    configs().get(handle)
}

/// # Safety
/// `out` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_quantization_config_create(
    out: *mut QcastQuantizationConfig,
) -> QcastStatus {
    const OP: &str = "qcast_quantization_config_create";
    run(OP, || {
        let out = out_arg(OP, "out", out)?;
        *out = configs().insert(QuantizationConfig::default());
        Ok(())
    })
}

/// Attach a noop flag tensor; `0` detaches it.
#[no_mangle]
pub extern "C" fn qcast_quantization_config_set_noop(
    cfg: QcastQuantizationConfig,
    noop: QcastTensor,
) -> QcastStatus {
    run("qcast_quantization_config_set_noop", || {
        let noop = if noop == 0 { None } else { Some(tensor(noop)?) };
        configs().update(cfg, |c| {
            c.noop = noop;
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn qcast_quantization_config_set_force_pow_2_scales(
    cfg: QcastQuantizationConfig,
    enabled: bool,
) -> QcastStatus {
    run("qcast_quantization_config_set_force_pow_2_scales", || {
        configs().update(cfg, |c| {
            c.force_pow_2_scales = enabled;
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn qcast_quantization_config_set_amax_epsilon(
    cfg: QcastQuantizationConfig,
    epsilon: f32,
) -> QcastStatus {
    const OP: &str = "qcast_quantization_config_set_amax_epsilon";
    run(OP, || {
        if !(epsilon.is_finite() && epsilon >= 0.0) {
            return Err(qcast_core::QcastError::invalid(
                OP,
                format!("amax epsilon must be finite and non-negative, got {epsilon}"),
            ));
        }
        configs().update(cfg, |c| {
            c.amax_epsilon = epsilon;
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn qcast_quantization_config_destroy(cfg: QcastQuantizationConfig) -> QcastStatus {
    run("qcast_quantization_config_destroy", || {
        configs().remove(cfg).map(|_| ())
    })
}
