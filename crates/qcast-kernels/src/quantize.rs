//! Host reference implementation of the fused cast kernels.
//!
//! One generic body, [`fused_cast`], is instantiated per fusion shape. The
//! const parameters and the activation type are fixed at compile time, so
//! an instantiation without dbias carries no reduction code and an
//! instantiation without an activation carries no activation math.
//!
//! Work is split into chunks of [`CHUNK_ROWS`] rows processed in parallel.
//! Every chunk writes its own output rows and returns its local amax, its
//! block scales and (for dbias variants) one row of per-column partial sums.
//! The chunk results are then folded sequentially, which keeps amax and the
//! bias gradient deterministic for a given shape.
//!
//! When the output carries a columnwise copy, the cast values of every
//! chunk are kept and quantized a second time in the columnwise layout
//! once all rows are known.

use rayon::prelude::*;

use qcast_core::format;
use qcast_core::scaling::compute_scale_from_amax;
use qcast_core::{DType, QcastError, Result, ScalingMode};

use crate::activation::Activation;
use crate::dbias::{reduce_dbias, workspace_shape};
use crate::CHUNK_ROWS;

const OP: &str = "fused_cast";

/// How the cast output is scaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantScaling {
    /// Plain cast to a high-precision dtype.
    HighPrecision,
    /// `q = sat(x · scale)` with one scale for the tensor.
    Tensor { scale: f32 },
    /// Per-block scales computed from each block's amax.
    Block {
        mode: ScalingMode,
        force_pow_2_scales: bool,
        amax_epsilon: f32,
    },
}

/// Read-only operands of a cast, viewed as a `rows × cols` matrix.
#[derive(Debug, Clone, Copy)]
pub struct CastInputs<'a> {
    pub rows: usize,
    pub cols: usize,
    pub input: &'a [u8],
    pub input_dtype: DType,
    /// Pre-activation values, same dtype as `input` (dact variants only).
    pub act_input: Option<&'a [u8]>,
    pub output_dtype: DType,
    pub scaling: QuantScaling,
    /// Noop flag value, read when the kernel runs.
    pub noop: Option<f32>,
}

/// Bias-gradient outputs of a dbias variant.
pub struct DbiasOutputs<'a> {
    pub dbias: &'a mut [u8],
    pub dbias_dtype: DType,
    /// F32 scratch of at least `workspace_shape(rows, cols)` elements.
    pub workspace: &'a mut [u8],
}

/// Columnwise copy of a quantized output.
pub struct ColumnwiseOutputs<'a> {
    /// Laid out per `ScalingMode::columnwise_data_dims`.
    pub data: &'a mut [u8],
    pub scale_inv: &'a mut [u8],
}

/// Buffers a cast writes.
pub struct CastOutputs<'a> {
    pub output: &'a mut [u8],
    /// F32, one element; folded with `max` (tensor scaling only).
    pub amax: Option<&'a mut [u8]>,
    pub scale_inv: Option<&'a mut [u8]>,
    pub dbias: Option<DbiasOutputs<'a>>,
    pub columnwise: Option<ColumnwiseOutputs<'a>>,
}

/// Signature shared by every monomorphized host kernel.
pub type HostKernelFn = fn(&CastInputs<'_>, &mut CastOutputs<'_>) -> Result<()>;

struct ChunkResult {
    amax: f32,
    col_sums: Vec<f32>,
    scale_inv: Vec<u8>,
    /// Cast values, kept only for a columnwise pass.
    values: Vec<f32>,
}

fn check_len(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(QcastError::invalid(
            OP,
            format!("{what} buffer holds {actual} bytes, need {expected}"),
        ));
    }
    Ok(())
}

/// Fused cast: optional activation or activation derivative, optional
/// column reduction into `dbias`, then quantization into `output`.
///
/// - `DBIAS`: accumulate the column sums of the cast value into `dbias`.
/// - `DACT`: the cast value is `input · A'(act_input)`.
/// - `ACT`: the cast value is `A(input)`.
pub fn fused_cast<const DBIAS: bool, const DACT: bool, const ACT: bool, A: Activation>(
    inp: &CastInputs<'_>,
    out: &mut CastOutputs<'_>,
) -> Result<()> {
    if inp.noop == Some(1.0) {
        return Ok(());
    }

    let (rows, cols) = (inp.rows, inp.cols);
    let numel = rows * cols;
    check_len("input", inp.input.len(), inp.input_dtype.storage_bytes(numel))?;
    check_len("output", out.output.len(), inp.output_dtype.storage_bytes(numel))?;
    if DACT {
        let act = inp
            .act_input
            .ok_or_else(|| QcastError::invalid(OP, "activation input is required"))?;
        check_len("activation input", act.len(), inp.input_dtype.storage_bytes(numel))?;
    }
    if numel == 0 {
        return Ok(());
    }

    let (ws_rows, _) = workspace_shape(rows, cols);
    if DBIAS {
        let d = out
            .dbias
            .as_ref()
            .ok_or_else(|| QcastError::invalid(OP, "dbias outputs are required"))?;
        check_len("dbias", d.dbias.len(), d.dbias_dtype.storage_bytes(cols))?;
        check_len("workspace", d.workspace.len(), DType::F32.storage_bytes(ws_rows * cols))?;
    }
    if let QuantScaling::Block { mode, .. } = inp.scaling {
        let (sr, sc) = mode.scale_inv_shape(rows, cols)?;
        let need = mode.scale_inv_dtype().storage_bytes(sr * sc);
        check_len("scale_inv", out.scale_inv.as_ref().map_or(0, |s| s.len()), need)?;
    }
    if let Some(col) = &out.columnwise {
        let scale_bytes = match inp.scaling {
            QuantScaling::HighPrecision => {
                return Err(QcastError::invalid(OP, "columnwise output needs an fp8 cast"));
            }
            QuantScaling::Tensor { .. } => DType::F32.storage_bytes(1),
            QuantScaling::Block { mode, .. } => {
                let (sr, sc) = mode.columnwise_scale_inv_shape(rows, cols)?;
                mode.scale_inv_dtype().storage_bytes(sr * sc)
            }
        };
        check_len("columnwise", col.data.len(), inp.output_dtype.storage_bytes(numel))?;
        check_len("columnwise scale_inv", col.scale_inv.len(), scale_bytes)?;
    }

    let keep_values = out.columnwise.is_some();
    let chunk_bytes = CHUNK_ROWS * cols * inp.output_dtype.element_size();
    let mut results: Vec<ChunkResult> = out
        .output
        .par_chunks_mut(chunk_bytes)
        .enumerate()
        .map(|(chunk, dst)| cast_chunk::<DBIAS, DACT, ACT, A>(inp, chunk, dst, keep_values))
        .collect();

    if let Some(col) = out.columnwise.as_mut() {
        let mut values = Vec::with_capacity(numel);
        for r in results.iter_mut() {
            values.append(&mut r.values);
        }
        quantize_columnwise(inp, &values, col);
    }

    match inp.scaling {
        QuantScaling::HighPrecision => {}
        QuantScaling::Tensor { scale } => {
            let local = results.iter().fold(0.0f32, |m, r| m.max(r.amax));
            if let Some(amax) = out.amax.as_deref_mut() {
                let prior = format::decode_element(DType::F32, amax);
                format::encode_element(DType::F32, prior.max(local), amax);
            }
            if let Some(scale_inv) = out.scale_inv.as_deref_mut() {
                format::encode_element(DType::F32, 1.0 / scale, scale_inv);
            }
        }
        QuantScaling::Block { .. } => {
            if let Some(scale_inv) = out.scale_inv.as_deref_mut() {
                let mut offset = 0;
                for r in &results {
                    scale_inv[offset..offset + r.scale_inv.len()].copy_from_slice(&r.scale_inv);
                    offset += r.scale_inv.len();
                }
            }
        }
    }

    if DBIAS {
        if let Some(d) = out.dbias.as_mut() {
            let row_bytes = DType::F32.storage_bytes(cols);
            for (chunk, r) in results.iter().enumerate() {
                let row = &mut d.workspace[chunk * row_bytes..(chunk + 1) * row_bytes];
                row.copy_from_slice(&format::encode_slice(DType::F32, &r.col_sums));
            }
            reduce_dbias(d.workspace, ws_rows, cols, d.dbias, d.dbias_dtype)?;
        }
    }
    Ok(())
}

fn cast_chunk<const DBIAS: bool, const DACT: bool, const ACT: bool, A: Activation>(
    inp: &CastInputs<'_>,
    chunk: usize,
    dst: &mut [u8],
    keep_values: bool,
) -> ChunkResult {
    let cols = inp.cols;
    let in_size = inp.input_dtype.element_size();
    let out_size = inp.output_dtype.element_size();
    let nrows = dst.len() / (cols * out_size);
    let base = chunk * CHUNK_ROWS * cols;

    let mut values = Vec::with_capacity(nrows * cols);
    let mut col_sums = if DBIAS { vec![0.0f32; cols] } else { Vec::new() };
    let mut amax = 0.0f32;

    for local in 0..nrows * cols {
        let offset = (base + local) * in_size;
        let x = format::decode_element(inp.input_dtype, &inp.input[offset..]);
        let v = if DACT {
            let a = inp
                .act_input
                .map_or(0.0, |act| format::decode_element(inp.input_dtype, &act[offset..]));
            x * A::derivative(a)
        } else if ACT {
            A::forward(x)
        } else {
            x
        };
        if DBIAS {
            col_sums[local % cols] += v;
        }
        amax = amax.max(v.abs());
        values.push(v);
    }

    let scale_inv = match inp.scaling {
        QuantScaling::HighPrecision => {
            for (d, &v) in dst.chunks_exact_mut(out_size).zip(&values) {
                format::encode_element(inp.output_dtype, v, d);
            }
            Vec::new()
        }
        QuantScaling::Tensor { scale } => {
            for (d, &v) in dst.chunks_exact_mut(out_size).zip(&values) {
                format::encode_element(inp.output_dtype, v * scale, d);
            }
            Vec::new()
        }
        QuantScaling::Block {
            mode,
            force_pow_2_scales,
            amax_epsilon,
        } => quantize_blocks(
            mode,
            mode.block_dims(nrows, cols),
            &values,
            nrows,
            cols,
            dst,
            inp.output_dtype,
            force_pow_2_scales,
            amax_epsilon,
        ),
    };

    ChunkResult {
        amax,
        col_sums,
        scale_inv,
        values: if keep_values { values } else { Vec::new() },
    }
}

/// Quantize the full `rows × cols` cast values into the columnwise copy.
fn quantize_columnwise(inp: &CastInputs<'_>, values: &[f32], col: &mut ColumnwiseOutputs<'_>) {
    let (rows, cols) = (inp.rows, inp.cols);
    let out_size = inp.output_dtype.element_size();
    let transposed = |scale: f32| -> Vec<f32> {
        let mut t = vec![0.0f32; values.len()];
        for (i, &v) in values.iter().enumerate() {
            t[(i % cols) * rows + i / cols] = v * scale;
        }
        t
    };
    match inp.scaling {
        QuantScaling::HighPrecision => {}
        QuantScaling::Tensor { scale } => {
            let t = transposed(scale);
            for (d, &v) in col.data.chunks_exact_mut(out_size).zip(&t) {
                format::encode_element(inp.output_dtype, v, d);
            }
            format::encode_element(DType::F32, 1.0 / scale, col.scale_inv);
        }
        QuantScaling::Block {
            mode,
            force_pow_2_scales,
            amax_epsilon,
        } => {
            let (drows, dcols) = mode.columnwise_data_dims(rows, cols);
            let data = if mode.columnwise_transposed() {
                transposed(1.0)
            } else {
                values.to_vec()
            };
            let encoded = quantize_blocks(
                mode,
                mode.columnwise_block_dims(rows, cols),
                &data,
                drows,
                dcols,
                col.data,
                inp.output_dtype,
                force_pow_2_scales,
                amax_epsilon,
            );
            col.scale_inv[..encoded.len()].copy_from_slice(&encoded);
        }
    }
}

/// Quantize an `nrows × cols` matrix with one scale per `block` tile;
/// returns the encoded `scale_inv` entries in row-major block order.
#[allow(clippy::too_many_arguments)]
fn quantize_blocks(
    mode: ScalingMode,
    block: (usize, usize),
    values: &[f32],
    nrows: usize,
    cols: usize,
    dst: &mut [u8],
    output_dtype: DType,
    pow2: bool,
    epsilon: f32,
) -> Vec<u8> {
    let fp8_max = output_dtype.max_finite().unwrap_or(f32::MAX);
    let (br, bc) = block;
    let nbc = cols.div_ceil(bc);
    let nblocks = nrows.div_ceil(br) * nbc;
    let block_of = |i: usize| (i / cols / br) * nbc + (i % cols) / bc;

    let mut block_amax = vec![0.0f32; nblocks];
    for (i, &v) in values.iter().enumerate() {
        let b = block_of(i);
        block_amax[b] = block_amax[b].max(v.abs());
    }

    let scale_dtype = mode.scale_inv_dtype();
    let mut scales = vec![1.0f32; nblocks];
    let mut encoded = vec![0u8; scale_dtype.storage_bytes(nblocks)];
    for (b, &amax) in block_amax.iter().enumerate() {
        let slot = &mut encoded[b * scale_dtype.element_size()..];
        if mode == ScalingMode::Mxfp8 {
            let e = format::f32_to_e8m0_round_up(amax / fp8_max);
            slot[0] = e;
            scales[b] = if e == 0 { 1.0 } else { format::pow2(127 - e as i32) };
        } else {
            let scale = compute_scale_from_amax(amax, fp8_max, epsilon, pow2);
            scales[b] = scale;
            format::encode_element(DType::F32, 1.0 / scale, slot);
        }
    }

    let out_size = output_dtype.element_size();
    for (i, (d, &v)) in dst.chunks_exact_mut(out_size).zip(values).enumerate() {
        format::encode_element(output_dtype, v * scales[block_of(i)], d);
    }
    encoded
}
