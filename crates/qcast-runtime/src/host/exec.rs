//! Executes a kernel launch on host buffers.
//!
//! Operands are copied out under short read locks, the kernel runs on the
//! copies, and outputs are written back one buffer at a time. No two buffer
//! locks are ever held together, so streams touching overlapping tensors
//! cannot deadlock each other.

use qcast_core::{DType, QcastError, Result, ScalingMode, Tensor};
use qcast_kernels::dequantize::{dequantize, DequantInputs};
use qcast_kernels::{CastInputs, CastOutputs, ColumnwiseOutputs, DbiasOutputs, QuantScaling};

use crate::runtime::{CastLaunch, DequantizeLaunch, KernelLaunch};

pub(crate) fn execute(launch: &KernelLaunch) -> Result<()> {
    match launch {
        KernelLaunch::Cast(c) => execute_cast(c),
        KernelLaunch::Dequantize(d) => execute_dequantize(d),
    }
}

fn read_scalar(t: Option<&qcast_core::Storage>) -> Result<Option<f32>> {
    match t {
        Some(s) => Ok(s.to_f32_vec()?.first().copied()),
        None => Ok(None),
    }
}

fn output_scaling(l: &CastLaunch) -> Result<QuantScaling> {
    let out = &l.output;
    if out.dtype().is_high_precision() {
        return Ok(QuantScaling::HighPrecision);
    }
    Ok(match out.scaling_mode() {
        ScalingMode::Tensor => QuantScaling::Tensor {
            scale: read_scalar(out.scale())?.unwrap_or(1.0),
        },
        mode => QuantScaling::Block {
            mode,
            force_pow_2_scales: l.force_pow_2_scales,
            amax_epsilon: l.amax_epsilon,
        },
    })
}

fn zeroed(t: Option<&qcast_core::Storage>) -> Option<Vec<u8>> {
    t.map(|s| vec![0u8; s.nbytes()])
}

fn execute_cast(l: &CastLaunch) -> Result<()> {
    let noop = match &l.noop {
        Some(t) => read_scalar(Some(t.storage()))?,
        None => None,
    };
    if noop == Some(1.0) || l.input.numel() == 0 {
        return Ok(());
    }

    let (rows, cols) = l.input.shape().flat_2d();
    let input = l.input.to_bytes()?;
    let act_input = l.act_input.as_ref().map(Tensor::to_bytes).transpose()?;
    let scaling = output_scaling(l)?;
    let tensor_scaled = matches!(scaling, QuantScaling::Tensor { .. });

    let mut output = vec![0u8; l.output.storage().nbytes()];
    let mut amax = match (tensor_scaled, l.output.amax()) {
        (true, Some(a)) => Some(a.to_bytes()?),
        _ => None,
    };
    let mut scale_inv = match scaling {
        QuantScaling::HighPrecision => None,
        _ => zeroed(l.output.scale_inv()),
    };
    let mut columnwise = match (l.output.columnwise(), l.output.columnwise_scale_inv()) {
        (Some(data), Some(si)) => Some((vec![0u8; data.nbytes()], vec![0u8; si.nbytes()])),
        _ => None,
    };
    let mut dbias = l.dbias.as_ref().map(|d| {
        (
            vec![0u8; d.dbias.storage().nbytes()],
            d.dbias.dtype(),
            vec![0u8; d.workspace.storage().nbytes()],
        )
    });

    let inputs = CastInputs {
        rows,
        cols,
        input: &input,
        input_dtype: l.input.dtype(),
        act_input: act_input.as_deref(),
        output_dtype: l.output.dtype(),
        scaling,
        noop,
    };
    let mut outputs = CastOutputs {
        output: &mut output,
        amax: amax.as_deref_mut(),
        scale_inv: scale_inv.as_deref_mut(),
        dbias: dbias.as_mut().map(|(dbias, dbias_dtype, workspace)| DbiasOutputs {
            dbias,
            dbias_dtype: *dbias_dtype,
            workspace,
        }),
        columnwise: columnwise
            .as_mut()
            .map(|(data, scale_inv)| ColumnwiseOutputs { data, scale_inv }),
    };
    (l.variant.host_entry())(&inputs, &mut outputs)?;

    l.output.storage().write_bytes(&output)?;
    if let (Some(bytes), Some(buf)) = (&amax, l.output.amax()) {
        buf.write_bytes(bytes)?;
    }
    if let (Some(bytes), Some(buf)) = (&scale_inv, l.output.scale_inv()) {
        buf.write_bytes(bytes)?;
    }
    if let (Some((data, si)), Some(data_buf), Some(si_buf)) = (
        &columnwise,
        l.output.columnwise(),
        l.output.columnwise_scale_inv(),
    ) {
        data_buf.write_bytes(data)?;
        si_buf.write_bytes(si)?;
    }
    if let (Some((bytes, _, ws)), Some(target)) = (&dbias, &l.dbias) {
        target.dbias.storage().write_bytes(bytes)?;
        target.workspace.storage().write_bytes(ws)?;
    }
    Ok(())
}

fn execute_dequantize(d: &DequantizeLaunch) -> Result<()> {
    if d.input.numel() == 0 {
        return Ok(());
    }
    let (rows, cols) = d.input.shape().flat_2d();
    let mode = d.input.scaling_mode();
    let (data, scale_inv) = if d.columnwise {
        (d.input.columnwise(), d.input.columnwise_scale_inv())
    } else {
        (Some(d.input.storage()), d.input.scale_inv())
    };
    let input = match data {
        Some(s) => s.to_bytes()?,
        None => return Err(QcastError::invalid("dequantize", "tensor has no columnwise data")),
    };
    let scale_inv = match scale_inv {
        Some(s) => s.to_bytes()?,
        None => qcast_core::format::encode_slice(DType::F32, &[1.0]),
    };
    let mut output = vec![0u8; d.output.storage().nbytes()];
    let inputs = DequantInputs {
        rows,
        cols,
        input: &input,
        input_dtype: d.input.dtype(),
        scaling_mode: mode,
        scale_inv: &scale_inv,
        output_dtype: d.output.dtype(),
        columnwise: d.columnwise,
    };
    dequantize(&inputs, &mut output)?;
    d.output.storage().write_bytes(&output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcast_kernels::KernelVariant;

    fn cast(input: &Tensor, output: &Tensor) -> KernelLaunch {
        KernelLaunch::Cast(CastLaunch {
            variant: KernelVariant::Cast,
            input: input.clone(),
            act_input: None,
            output: output.clone(),
            dbias: None,
            noop: None,
            force_pow_2_scales: false,
            amax_epsilon: 0.0,
        })
    }

    #[test]
    fn test_cast_writes_back_every_buffer() {
        let x = Tensor::from_f32(&[1.0, -2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let q = Tensor::quantized(&[2, 2], DType::Float8E4M3, ScalingMode::Tensor)
            .unwrap()
            .with_scale(0.5)
            .unwrap();
        execute(&cast(&x, &q)).unwrap();
        assert_eq!(q.to_f32_vec().unwrap(), vec![0.5, -1.0, 1.5, 2.0]);
        assert_eq!(q.amax_value().unwrap(), 4.0);
        assert_eq!(q.scale_inv_values().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_dequantize_round_trip() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let q = Tensor::quantized(&[2, 2], DType::Float8E5M2, ScalingMode::Tensor)
            .unwrap()
            .with_scale(4.0)
            .unwrap();
        execute(&cast(&x, &q)).unwrap();
        let y = Tensor::zeros(&[2, 2], DType::F32);
        execute(&KernelLaunch::Dequantize(DequantizeLaunch {
            input: q,
            output: y.clone(),
            columnwise: false,
        }))
        .unwrap();
        assert_eq!(y.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_noop_at_execution_time() {
        let x = Tensor::from_f32(&[1.0, 2.0], &[2]).unwrap();
        let q = Tensor::quantized(&[2], DType::Float8E4M3, ScalingMode::Tensor).unwrap();
        let flag = Tensor::scalar(1.0);
        let KernelLaunch::Cast(mut c) = cast(&x, &q) else {
            unreachable!()
        };
        c.noop = Some(flag.clone());
        execute(&KernelLaunch::Cast(c.clone())).unwrap();
        assert_eq!(q.to_f32_vec().unwrap(), vec![0.0, 0.0]);
        assert_eq!(q.amax_value().unwrap(), 0.0);

        flag.storage().write_f32(&[0.0]).unwrap();
        execute(&KernelLaunch::Cast(c)).unwrap();
        assert_eq!(q.to_f32_vec().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_columnwise_copy_written_and_read_back() {
        let x = Tensor::from_f32(&[1.0, -2.0, 3.0, 4.0, 0.5, -6.0], &[2, 3]).unwrap();
        let q = Tensor::quantized(&[2, 3], DType::Float8E4M3, ScalingMode::Block1D)
            .unwrap()
            .with_columnwise()
            .unwrap();
        execute(&cast(&x, &q)).unwrap();
        assert_eq!(q.columnwise_scale_inv_values().unwrap().len(), 3);
        assert!(q.columnwise_bytes().unwrap().iter().any(|&b| b != 0));

        for columnwise in [false, true] {
            let y = Tensor::zeros(&[2, 3], DType::F32);
            execute(&KernelLaunch::Dequantize(DequantizeLaunch {
                input: q.clone(),
                output: y.clone(),
                columnwise,
            }))
            .unwrap();
            for (got, want) in y.to_f32_vec().unwrap().iter().zip(x.to_f32_vec().unwrap()) {
                assert!((got - want).abs() <= want.abs() / 8.0, "{got} vs {want}");
            }
        }
    }
}
