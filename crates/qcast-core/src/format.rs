//! Element codecs for every [`DType`].
//!
//! All multi-byte values are stored native-endian, exactly as a device
//! kernel would see them. FP8 encoders saturate to the format's largest
//! finite value; NaN is preserved.

use float8::{F8E4M3, F8E5M2};
use half::{bf16, f16};

use crate::DType;

/// E8M0 code reserved for NaN.
pub const E8M0_NAN: u8 = 0xFF;

/// Exact power of two `2^exp` for `exp` in the f32 range (subnormals included).
pub fn pow2(exp: i32) -> f32 {
    if exp > 127 {
        f32::INFINITY
    } else if exp >= -126 {
        f32::from_bits(((exp + 127) as u32) << 23)
    } else if exp >= -149 {
        f32::from_bits(1u32 << (exp + 149))
    } else {
        0.0
    }
}

/// Encode `v` as E4M3, clamping finite overflow to ±448.
pub fn f32_to_e4m3(v: f32) -> u8 {
    let max = 448.0;
    let v = if v.is_nan() { v } else { v.clamp(-max, max) };
    F8E4M3::from_f32(v).to_bits()
}

/// Encode `v` as E5M2, clamping overflow (infinities included) to ±57344.
pub fn f32_to_e5m2(v: f32) -> u8 {
    let max = 57344.0;
    let v = if v.is_nan() { v } else { v.clamp(-max, max) };
    F8E5M2::from_f32(v).to_bits()
}

pub fn e4m3_to_f32(bits: u8) -> f32 {
    F8E4M3::from_bits(bits).to_f32()
}

pub fn e5m2_to_f32(bits: u8) -> f32 {
    F8E5M2::from_bits(bits).to_f32()
}

/// Biased exponent of `v`, rounded up so that `2^(e-127) >= v`.
///
/// Zero and negative-exponent underflow map to code 0, infinity to 0xFE
/// and NaN to [`E8M0_NAN`].
pub fn f32_to_e8m0_round_up(v: f32) -> u8 {
    if v.is_nan() {
        return E8M0_NAN;
    }
    if v.is_infinite() {
        return 0xFE;
    }
    let bits = v.abs().to_bits();
    let mut exponent = (bits >> 23) & 0xFF;
    let mantissa = bits & 0x7F_FFFF;
    // Subnormals up to 2^-127 already fit in code 0.
    let fits_zero_code = exponent == 0 && mantissa <= 0x40_0000;
    if mantissa > 0 && exponent != 0xFE && !fits_zero_code {
        exponent += 1;
    }
    exponent as u8
}

/// Decode an E8M0 code to `2^(code-127)`.
pub fn e8m0_to_f32(code: u8) -> f32 {
    if code == E8M0_NAN {
        f32::NAN
    } else {
        pow2(code as i32 - 127)
    }
}

/// Decode one element starting at `bytes[0]`.
pub fn decode_element(dtype: DType, bytes: &[u8]) -> f32 {
    match dtype {
        DType::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        DType::F16 => f16::from_bits(u16::from_ne_bytes([bytes[0], bytes[1]])).to_f32(),
        DType::BF16 => bf16::from_bits(u16::from_ne_bytes([bytes[0], bytes[1]])).to_f32(),
        DType::Float8E4M3 => e4m3_to_f32(bytes[0]),
        DType::Float8E5M2 => e5m2_to_f32(bytes[0]),
        DType::Float8E8M0 => e8m0_to_f32(bytes[0]),
        DType::Byte => bytes[0] as f32,
    }
}

/// Encode one element into `out[..dtype.element_size()]`.
pub fn encode_element(dtype: DType, v: f32, out: &mut [u8]) {
    match dtype {
        DType::F32 => out[..4].copy_from_slice(&v.to_ne_bytes()),
        DType::F16 => out[..2].copy_from_slice(&f16::from_f32(v).to_bits().to_ne_bytes()),
        DType::BF16 => out[..2].copy_from_slice(&bf16::from_f32(v).to_bits().to_ne_bytes()),
        DType::Float8E4M3 => out[0] = f32_to_e4m3(v),
        DType::Float8E5M2 => out[0] = f32_to_e5m2(v),
        DType::Float8E8M0 => out[0] = f32_to_e8m0_round_up(v),
        DType::Byte => out[0] = v.clamp(0.0, 255.0) as u8,
    }
}

/// Decode a whole buffer.
pub fn decode_slice(dtype: DType, bytes: &[u8]) -> Vec<f32> {
    if dtype == DType::F32 {
        return bytemuck::pod_collect_to_vec::<u8, f32>(bytes);
    }
    bytes
        .chunks_exact(dtype.element_size())
        .map(|c| decode_element(dtype, c))
        .collect()
}

/// Encode a whole buffer.
pub fn encode_slice(dtype: DType, values: &[f32]) -> Vec<u8> {
    if dtype == DType::F32 {
        return bytemuck::cast_slice::<f32, u8>(values).to_vec();
    }
    let size = dtype.element_size();
    let mut out = vec![0u8; values.len() * size];
    for (chunk, &v) in out.chunks_exact_mut(size).zip(values) {
        encode_element(dtype, v, chunk);
    }
    out
}

/// Round `v` through `dtype` and back.
pub fn round_trip(dtype: DType, v: f32) -> f32 {
    let mut buf = [0u8; 4];
    encode_element(dtype, v, &mut buf);
    decode_element(dtype, &buf)
}
