// SPDX-License-Identifier: CEPL-1.0
use half::f16;

/// IEEE binary16 bits for `v`.
#[inline]
pub fn quantize_half(v: f32) -> u16 {
    f16::from_f32(v).to_bits()
}

#[inline]
pub fn dequantize_half(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// Maps [-1, 1] onto [0, 255]; 0.0 lands on 127.5 and rounds to 128.
#[inline]
pub fn encode_unorm8(n: f32) -> u8 {
    (n.clamp(-1.0, 1.0) * 127.5 + 127.5).round() as u8
}

#[inline]
pub fn quantize_snorm8(v: f32) -> i8 {
    (v.clamp(-1.0, 1.0) * 127.0).round() as i8
}

/// Rounds up, so the stored value is never smaller than the exact one.
#[inline]
pub fn quantize_snorm8_ceil(v: f32) -> i8 {
    (v.clamp(-1.0, 1.0) * 127.0).ceil().min(127.0) as i8
}

#[inline]
pub fn dequantize_snorm8(b: i8) -> f32 {
    (b as f32 / 127.0).max(-1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_keeps_small_integers_exact() {
        for v in [-2.0f32, -1.0, 0.0, 0.5, 1.0, 1024.0] {
            assert_eq!(dequantize_half(quantize_half(v)), v);
        }
    }

    #[test]
    fn unorm8_normal_encoding_hits_the_ends() {
        assert_eq!(encode_unorm8(-1.0), 0);
        assert_eq!(encode_unorm8(1.0), 255);
        assert_eq!(encode_unorm8(0.0), 128);
        assert_eq!(encode_unorm8(7.0), 255);
        // 0.3 * 127.5 + 127.5 = 165.75
        assert_eq!(encode_unorm8(0.3), 166);
    }

    #[test]
    fn snorm8_ceil_never_undershoots() {
        for i in 0..=100 {
            let v = i as f32 / 100.0;
            let q = quantize_snorm8_ceil(v);
            assert!(dequantize_snorm8(q) + 1e-6 >= v, "{v} -> {q}");
        }
        assert_eq!(quantize_snorm8_ceil(1.0), 127);
        assert_eq!(quantize_snorm8(-1.0), -127);
    }
}
