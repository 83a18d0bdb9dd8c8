use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a qcast tensor can hold.
///
/// High-precision types are the inputs of every cast; the FP8 types are the
/// quantized representations; `Float8E8M0` only ever stores power-of-two
/// block scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Raw bytes (opaque payload).
    Byte,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
    /// 8-bit float, 4 exponent bits, 3 mantissa bits, no infinities
    Float8E4M3,
    /// 8-bit float, 5 exponent bits, 2 mantissa bits
    Float8E5M2,
    /// 8-bit biased exponent, no sign and no mantissa (block scales)
    Float8E8M0,
}

impl DType {
    /// All dtypes, in C ABI order.
    pub const ALL: [DType; 7] = [
        DType::Byte,
        DType::F32,
        DType::F16,
        DType::BF16,
        DType::Float8E4M3,
        DType::Float8E5M2,
        DType::Float8E8M0,
    ];

    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::Byte | DType::Float8E4M3 | DType::Float8E5M2 | DType::Float8E8M0 => 1,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this dtype is a valid cast input / dequantize output.
    pub fn is_high_precision(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Whether this dtype holds quantized FP8 data.
    pub fn is_fp8(&self) -> bool {
        matches!(self, DType::Float8E4M3 | DType::Float8E5M2)
    }

    /// Largest finite value representable, for the floating formats.
    pub fn max_finite(&self) -> Option<f32> {
        match self {
            DType::F32 => Some(f32::MAX),
            DType::F16 => Some(65504.0),
            DType::BF16 => Some(half::bf16::MAX.to_f32()),
            DType::Float8E4M3 => Some(448.0),
            DType::Float8E5M2 => Some(57344.0),
            DType::Float8E8M0 | DType::Byte => None,
        }
    }

    /// Machine epsilon (distance from 1.0 to the next representable value).
    pub fn epsilon(&self) -> Option<f32> {
        match self {
            DType::F32 => Some(f32::EPSILON),
            DType::F16 => Some(2f32.powi(-10)),
            DType::BF16 => Some(2f32.powi(-7)),
            DType::Float8E4M3 => Some(2f32.powi(-3)),
            DType::Float8E5M2 => Some(2f32.powi(-2)),
            DType::Float8E8M0 | DType::Byte => None,
        }
    }

    /// Stable integer code used by the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            DType::Byte => 0,
            DType::F32 => 1,
            DType::F16 => 2,
            DType::BF16 => 3,
            DType::Float8E4M3 => 4,
            DType::Float8E5M2 => 5,
            DType::Float8E8M0 => 6,
        }
    }

    /// Inverse of [`DType::code`].
    pub fn from_code(code: i32) -> Option<DType> {
        DType::ALL.iter().copied().find(|d| d.code() == code)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Byte => write!(f, "byte"),
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::Float8E4M3 => write!(f, "f8e4m3"),
            DType::Float8E5M2 => write!(f, "f8e5m2"),
            DType::Float8E8M0 => write!(f, "f8e8m0"),
        }
    }
}
