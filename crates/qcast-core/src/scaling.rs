//! Scaling modes of quantized tensors and the scale-factor formulas.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DType, QcastError, Result};

/// Elements per MXFP8 scaling block (1×32 along a row).
pub const MXFP8_BLOCK: usize = 32;

/// Edge of a block-scaling tile (1×128 or 128×128).
pub const BLOCK_SCALING_TILE: usize = 128;

/// How a quantized tensor's scale factors are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScalingMode {
    /// One scale for the whole tensor (delayed scaling).
    #[default]
    Tensor,
    /// E8M0 scale per 1×32 block.
    Mxfp8,
    /// F32 scale per 1×128 block.
    Block1D,
    /// F32 scale per 128×128 tile.
    Block2D,
}

impl ScalingMode {
    pub const ALL: [ScalingMode; 4] = [
        ScalingMode::Tensor,
        ScalingMode::Mxfp8,
        ScalingMode::Block1D,
        ScalingMode::Block2D,
    ];

    /// Dtype of the `scale_inv` buffer.
    pub fn scale_inv_dtype(&self) -> DType {
        match self {
            ScalingMode::Mxfp8 => DType::Float8E8M0,
            _ => DType::F32,
        }
    }

    /// Whether the mode computes its scales inside the kernel.
    pub fn is_block(&self) -> bool {
        !matches!(self, ScalingMode::Tensor)
    }

    /// `(block_rows, block_cols)` covered by one scale.
    pub fn block_dims(&self, rows: usize, cols: usize) -> (usize, usize) {
        match self {
            ScalingMode::Tensor => (rows.max(1), cols.max(1)),
            ScalingMode::Mxfp8 => (1, MXFP8_BLOCK),
            ScalingMode::Block1D => (1, BLOCK_SCALING_TILE),
            ScalingMode::Block2D => (BLOCK_SCALING_TILE, BLOCK_SCALING_TILE),
        }
    }

    /// Shape of the `scale_inv` buffer for a `rows × cols` tensor.
    pub fn scale_inv_shape(&self, rows: usize, cols: usize) -> Result<(usize, usize)> {
        match self {
            ScalingMode::Tensor => Ok((1, 1)),
            ScalingMode::Mxfp8 => {
                if cols % MXFP8_BLOCK != 0 {
                    return Err(QcastError::invalid(
                        "scale_inv_shape",
                        format!("mxfp8 needs the last dimension divisible by {MXFP8_BLOCK}, got {cols}"),
                    ));
                }
                Ok((rows, cols / MXFP8_BLOCK))
            }
            ScalingMode::Block1D => Ok((rows, cols.div_ceil(BLOCK_SCALING_TILE))),
            ScalingMode::Block2D => Ok((
                rows.div_ceil(BLOCK_SCALING_TILE),
                cols.div_ceil(BLOCK_SCALING_TILE),
            )),
        }
    }

    /// Whether the columnwise copy is stored transposed (`cols × rows`).
    /// MXFP8 keeps the rowwise layout and scales 32×1 blocks instead.
    pub fn columnwise_transposed(&self) -> bool {
        !matches!(self, ScalingMode::Mxfp8)
    }

    /// `(rows, cols)` of the columnwise data buffer.
    pub fn columnwise_data_dims(&self, rows: usize, cols: usize) -> (usize, usize) {
        if self.columnwise_transposed() {
            (cols, rows)
        } else {
            (rows, cols)
        }
    }

    /// Block covered by one columnwise scale, in the columnwise buffer's
    /// own coordinates.
    pub fn columnwise_block_dims(&self, rows: usize, cols: usize) -> (usize, usize) {
        match self {
            ScalingMode::Mxfp8 => (MXFP8_BLOCK, 1),
            _ => {
                let (r, c) = self.columnwise_data_dims(rows, cols);
                self.block_dims(r, c)
            }
        }
    }

    /// Shape of the columnwise `scale_inv` buffer for a `rows × cols` tensor.
    pub fn columnwise_scale_inv_shape(&self, rows: usize, cols: usize) -> Result<(usize, usize)> {
        match self {
            ScalingMode::Mxfp8 => {
                if rows % MXFP8_BLOCK != 0 {
                    return Err(QcastError::invalid(
                        "columnwise_scale_inv_shape",
                        format!("columnwise mxfp8 needs the row count divisible by {MXFP8_BLOCK}, got {rows}"),
                    ));
                }
                Ok((rows / MXFP8_BLOCK, cols))
            }
            _ => self.scale_inv_shape(cols, rows),
        }
    }

    /// Stable integer code used by the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            ScalingMode::Tensor => 0,
            ScalingMode::Mxfp8 => 1,
            ScalingMode::Block1D => 2,
            ScalingMode::Block2D => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<ScalingMode> {
        ScalingMode::ALL.iter().copied().find(|m| m.code() == code)
    }
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingMode::Tensor => write!(f, "tensor"),
            ScalingMode::Mxfp8 => write!(f, "mxfp8"),
            ScalingMode::Block1D => write!(f, "block1d"),
            ScalingMode::Block2D => write!(f, "block2d"),
        }
    }
}

/// Quantization scale for a block-scaled tile with absolute maximum `amax`.
///
/// `scale = fp8_max / max(amax, epsilon)`; an all-zero tile gets `1`, an
/// overflowing scale is clamped to `f32::MAX` and `pow2` rounds down to a
/// power of two.
pub fn compute_scale_from_amax(amax: f32, fp8_max: f32, epsilon: f32, pow2: bool) -> f32 {
    let amax = amax.max(epsilon);
    if amax == 0.0 {
        return 1.0;
    }
    let mut scale = fp8_max / amax;
    if scale.is_infinite() {
        scale = f32::MAX;
    }
    if scale.is_nan() {
        return 1.0;
    }
    if pow2 {
        // Clear the mantissa: floor to a power of two.
        scale = f32::from_bits(scale.to_bits() & 0xFF80_0000);
        if scale == 0.0 {
            scale = f32::MIN_POSITIVE;
        }
    }
    scale
}
