//! FP16 / BF16 packing for low-precision shadow weights.
//!
//! Conversions round to nearest even. BF16 keeps the f32 sign, the full 8-bit
//! exponent and the top 7 mantissa bits, so it never overflows for finite
//! input. FP16 maps finite values beyond its range to ±Inf. A finite input
//! never produces NaN; Inf and NaN survive a round trip as Inf and NaN.

use half::{bf16, f16};

use crate::api::types::PackedDType;

#[inline]
pub fn f32_to_f16_bits(v: f32) -> u16 {
    f16::from_f32(v).to_bits()
}

#[inline]
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

#[inline]
pub fn f32_to_bf16_bits(v: f32) -> u16 {
    bf16::from_f32(v).to_bits()
}

#[inline]
pub fn bf16_bits_to_f32(bits: u16) -> f32 {
    bf16::from_bits(bits).to_f32()
}

impl PackedDType {
    #[inline]
    pub fn pack_one(self, v: f32) -> u16 {
        match self {
            PackedDType::F16 => f32_to_f16_bits(v),
            PackedDType::BF16 => f32_to_bf16_bits(v),
        }
    }

    #[inline]
    pub fn unpack_one(self, bits: u16) -> f32 {
        match self {
            PackedDType::F16 => f16_bits_to_f32(bits),
            PackedDType::BF16 => bf16_bits_to_f32(bits),
        }
    }

    /// Largest finite value of the format.
    pub fn max_finite(self) -> f32 {
        match self {
            PackedDType::F16 => f16::MAX.to_f32(),
            PackedDType::BF16 => bf16::MAX.to_f32(),
        }
    }

    /// Worst-case absolute round-trip error for `v` (half an ULP, or the
    /// subnormal spacing for FP16 values near zero).
    pub fn round_trip_bound(self, v: f32) -> f32 {
        match self {
            PackedDType::F16 => (v.abs() * 2f32.powi(-11)).max(2f32.powi(-25)),
            PackedDType::BF16 => (v.abs() * 2f32.powi(-8)).max(f32::MIN_POSITIVE),
        }
    }
}

/// Pack `src` into `dst` (same length).
pub fn pack(dtype: PackedDType, src: &[f32], dst: &mut [u16]) {
    assert_eq!(src.len(), dst.len(), "pack: length mismatch");
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = dtype.pack_one(s);
    }
}

/// Unpack `src` into `dst` (same length).
pub fn unpack(dtype: PackedDType, src: &[u16], dst: &mut [f32]) {
    assert_eq!(src.len(), dst.len(), "unpack: length mismatch");
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = dtype.unpack_one(s);
    }
}
