//! Quantize / dequantize entry points.
//!
//! Every call validates its handles and operands, enqueues on `stream` and
//! returns; results are visible after `qcast_stream_synchronize`.

use qcast_core::{QuantizationConfig, Result};
use qcast_kernels::ActivationKind;

use crate::config::{config, QcastQuantizationConfig};
use crate::error::{out_arg, run, slice_arg, QcastStatus};
use crate::stream::{resolve, QcastStream};
use crate::tensor::{tensor, QcastTensor};

/// `0` stands for the default config.
fn config_or_default(cfg: QcastQuantizationConfig) -> Result<QuantizationConfig> {
    if cfg == 0 {
        Ok(QuantizationConfig::default())
    } else {
        config(cfg)
    }
}

#[no_mangle]
pub extern "C" fn qcast_quantize(input: QcastTensor, output: QcastTensor, stream: QcastStream) -> QcastStatus {
    run("qcast_quantize", || {
        let (engine, stream) = resolve(stream)?;
        engine.quantize(&tensor(input)?, &tensor(output)?, &stream)
    })
}

/// Like [`qcast_quantize`], skipped entirely when `noop` holds `1.0` at
/// execution time.
#[no_mangle]
pub extern "C" fn qcast_quantize_noop(
    input: QcastTensor,
    output: QcastTensor,
    noop: QcastTensor,
    stream: QcastStream,
) -> QcastStatus {
    run("qcast_quantize_noop", || {
        let (engine, stream) = resolve(stream)?;
        engine.quantize_noop(&tensor(input)?, &tensor(output)?, &tensor(noop)?, &stream)
    })
}

#[no_mangle]
pub extern "C" fn qcast_quantize_v2(
    input: QcastTensor,
    output: QcastTensor,
    cfg: QcastQuantizationConfig,
    stream: QcastStream,
) -> QcastStatus {
    run("qcast_quantize_v2", || {
        let cfg = config_or_default(cfg)?;
        let (engine, stream) = resolve(stream)?;
        engine.quantize_with_config(&tensor(input)?, &tensor(output)?, &cfg, &stream)
    })
}

#[no_mangle]
pub extern "C" fn qcast_quantize_dbias(
    input: QcastTensor,
    output: QcastTensor,
    dbias: QcastTensor,
    workspace: QcastTensor,
    stream: QcastStream,
) -> QcastStatus {
    run("qcast_quantize_dbias", || {
        let (engine, stream) = resolve(stream)?;
        engine.quantize_dbias(
            &tensor(input)?,
            &tensor(output)?,
            &tensor(dbias)?,
            &tensor(workspace)?,
            &stream,
        )
    })
}

fn dbias_dact(
    kind: ActivationKind,
    input: QcastTensor,
    act_input: QcastTensor,
    output: QcastTensor,
    dbias: QcastTensor,
    workspace: QcastTensor,
    stream: QcastStream,
) -> Result<()> {
    let (engine, stream) = resolve(stream)?;
    engine.quantize_dbias_dactivation(
        kind,
        &tensor(input)?,
        &tensor(act_input)?,
        &tensor(output)?,
        &tensor(dbias)?,
        &tensor(workspace)?,
        &stream,
    )
}

macro_rules! dbias_dact_entry {
    ($name:ident, $kind:expr) => {
        #[no_mangle]
        pub extern "C" fn $name(
            input: QcastTensor,
            act_input: QcastTensor,
            output: QcastTensor,
            dbias: QcastTensor,
            workspace: QcastTensor,
            stream: QcastStream,
        ) -> QcastStatus {
            run(stringify!($name), || {
                dbias_dact($kind, input, act_input, output, dbias, workspace, stream)
            })
        }
    };
}

dbias_dact_entry!(qcast_quantize_dbias_dgelu, ActivationKind::Gelu);
dbias_dact_entry!(qcast_quantize_dbias_dsilu, ActivationKind::Silu);
dbias_dact_entry!(qcast_quantize_dbias_drelu, ActivationKind::Relu);
dbias_dact_entry!(qcast_quantize_dbias_dqgelu, ActivationKind::QGelu);
dbias_dact_entry!(qcast_quantize_dbias_dsrelu, ActivationKind::SRelu);

#[no_mangle]
pub extern "C" fn qcast_dequantize(input: QcastTensor, output: QcastTensor, stream: QcastStream) -> QcastStatus {
    run("qcast_dequantize", || {
        let (engine, stream) = resolve(stream)?;
        engine.dequantize(&tensor(input)?, &tensor(output)?, &stream)
    })
}

/// Dequantize `input`'s columnwise copy into `output` (same shape as
/// `input`).
#[no_mangle]
pub extern "C" fn qcast_dequantize_columnwise(input: QcastTensor, output: QcastTensor, stream: QcastStream) -> QcastStatus {
    run("qcast_dequantize_columnwise", || {
        let (engine, stream) = resolve(stream)?;
        engine.dequantize_columnwise(&tensor(input)?, &tensor(output)?, &stream)
    })
}

/// Quantize `n` tensors over the compute stream pool, joined back to
/// `stream`. Nothing is enqueued unless every pair is valid.
///
/// # Safety
/// `inputs` and `outputs` must each point to `n` handles.
#[no_mangle]
pub unsafe extern "C" fn qcast_multi_tensor_quantize(
    inputs: *const QcastTensor,
    outputs: *const QcastTensor,
    cfg: QcastQuantizationConfig,
    n: usize,
    stream: QcastStream,
) -> QcastStatus {
    const OP: &str = "qcast_multi_tensor_quantize";
    run(OP, || {
        let inputs = slice_arg(OP, "inputs", inputs, n)?
            .iter()
            .map(|&h| tensor(h))
            .collect::<Result<Vec<_>>>()?;
        let outputs = slice_arg(OP, "outputs", outputs, n)?
            .iter()
            .map(|&h| tensor(h))
            .collect::<Result<Vec<_>>>()?;
        let cfg = config_or_default(cfg)?;
        let (engine, stream) = resolve(stream)?;
        engine.multi_tensor_quantize(&inputs, &outputs, &cfg, &stream)
    })
}

/// Shape of the F32 workspace the dbias variants need for `input`.
///
/// # Safety
/// `rows` and `cols` must be writable.
#[no_mangle]
pub unsafe extern "C" fn qcast_dbias_workspace_shape(
    input: QcastTensor,
    rows: *mut usize,
    cols: *mut usize,
) -> QcastStatus {
    const OP: &str = "qcast_dbias_workspace_shape";
    run(OP, || {
        let rows = out_arg(OP, "rows", rows)?;
        let cols = out_arg(OP, "cols", cols)?;
        let engine = qcast_runtime::global::engine()?;
        (*rows, *cols) = engine.dbias_workspace(&tensor(input)?);
        Ok(())
    })
}
