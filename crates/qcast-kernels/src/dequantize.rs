//! Host dequantize kernel: FP8 data times its `scale_inv` factor.
//!
//! Either copy of a quantized tensor can be read; the output is always
//! written in the rowwise `rows × cols` orientation.

use rayon::prelude::*;

use qcast_core::format;
use qcast_core::{DType, QcastError, Result, ScalingMode};

use crate::CHUNK_ROWS;

/// Operands of a dequantize, viewed as a `rows × cols` matrix.
#[derive(Debug, Clone, Copy)]
pub struct DequantInputs<'a> {
    pub rows: usize,
    pub cols: usize,
    pub input: &'a [u8],
    pub input_dtype: DType,
    pub scaling_mode: ScalingMode,
    /// Encoded in `scaling_mode.scale_inv_dtype()`.
    pub scale_inv: &'a [u8],
    pub output_dtype: DType,
    /// `input` and `scale_inv` are the columnwise copy.
    pub columnwise: bool,
}

/// Where logical element `(r, c)` and its scale live in the buffer read.
struct Layout {
    transposed: bool,
    data_cols: usize,
    block: (usize, usize),
    scale_cols: usize,
}

impl Layout {
    fn new(inp: &DequantInputs<'_>) -> Result<Self> {
        let (rows, cols) = (inp.rows, inp.cols);
        let mode = inp.scaling_mode;
        Ok(if inp.columnwise {
            let (_, sc) = mode.columnwise_scale_inv_shape(rows, cols)?;
            Layout {
                transposed: mode.columnwise_transposed(),
                data_cols: mode.columnwise_data_dims(rows, cols).1,
                block: mode.columnwise_block_dims(rows, cols),
                scale_cols: sc,
            }
        } else {
            let (_, sc) = mode.scale_inv_shape(rows, cols)?;
            Layout {
                transposed: false,
                data_cols: cols,
                block: mode.block_dims(rows, cols),
                scale_cols: sc,
            }
        })
    }

    /// `(data index, factor index)` of logical element `(r, c)`.
    fn locate(&self, r: usize, c: usize) -> (usize, usize) {
        let (dr, dc) = if self.transposed { (c, r) } else { (r, c) };
        let (br, bc) = self.block;
        (dr * self.data_cols + dc, (dr / br) * self.scale_cols + dc / bc)
    }
}

pub fn dequantize(inp: &DequantInputs<'_>, output: &mut [u8]) -> Result<()> {
    const OP: &str = "dequantize";
    let (rows, cols) = (inp.rows, inp.cols);
    let numel = rows * cols;
    if inp.input.len() < inp.input_dtype.storage_bytes(numel)
        || output.len() < inp.output_dtype.storage_bytes(numel)
    {
        return Err(QcastError::invalid(OP, "data buffers are smaller than the tensor"));
    }
    if numel == 0 {
        return Ok(());
    }

    let mode = inp.scaling_mode;
    let (sr, sc) = if inp.columnwise {
        mode.columnwise_scale_inv_shape(rows, cols)?
    } else {
        mode.scale_inv_shape(rows, cols)?
    };
    let layout = Layout::new(inp)?;
    let factors = format::decode_slice(mode.scale_inv_dtype(), inp.scale_inv);
    if factors.len() < sr * sc {
        return Err(QcastError::invalid(
            OP,
            format!("scale_inv holds {} factors, need {}", factors.len(), sr * sc),
        ));
    }

    let in_size = inp.input_dtype.element_size();
    let out_size = inp.output_dtype.element_size();
    output[..numel * out_size]
        .par_chunks_mut(CHUNK_ROWS * cols * out_size)
        .enumerate()
        .for_each(|(chunk, dst)| {
            let base = chunk * CHUNK_ROWS * cols;
            for (local, slot) in dst.chunks_exact_mut(out_size).enumerate() {
                let i = base + local;
                let (src, f) = layout.locate(i / cols, i % cols);
                let factor = factors[f];
                let q = format::decode_element(inp.input_dtype, &inp.input[src * in_size..]);
                format::encode_element(inp.output_dtype, q * factor, slot);
            }
        });
    Ok(())
}
