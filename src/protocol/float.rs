//! Exact double encoding as an (exponent, mantissa) pair of signed varints
//!
//! value = mantissa * 2^exponent for ordinary numbers. Exponents far
//! outside the IEEE range are sentinels:
//!
//! | exponent          | meaning                                  |
//! |-------------------|------------------------------------------|
//! | -1048575          | -0.0 (mantissa -1)                       |
//! | 1048575           | ±Inf (sign of mantissa)                  |
//! | 1048574           | signalling NaN, payload in mantissa      |
//! | 1048573           | quiet NaN, payload in mantissa           |
//! | 1048572..=1048565 | the eight common NaN bit patterns below  |
//! | 1047550..=1048564 | reserved NaN forms, read as signalling   |
//!
//! `f64::to_bits` already yields the IEEE layout regardless of the
//! host's byte order, so all manipulation is plain integer work.

use super::encoder::DecodeError;

pub const MIN_EXP: i64 = -1_000_000;
pub const MAX_EXP: i64 = 1_000_000;
pub const NEG_ZERO: i64 = -1_048_575;
pub const INF: i64 = 1_048_575;
pub const NAN_FIRST: i64 = 1_048_574;
pub const NAN_LAST: i64 = 1_047_550;
pub const SNAN: i64 = NAN_FIRST;
pub const QNAN: i64 = NAN_FIRST - 1;

const SIGN: u64 = 1 << 63;
const EXP_MASK: u64 = 0x7FF0_0000_0000_0000;
const FRAC_MASK: u64 = (1 << 52) - 1;
const QUIET_BIT: u64 = 0x0008_0000_0000_0000;
const PAYLOAD_MASK: u64 = 0x0007_FFFF_FFFF_FFFF;
/// Exponent of the least significant mantissa bit for biased exponent 0.
const BIAS: i64 = 1023 + 52;

/// NaN patterns with a dedicated sentinel, sign bit cleared.
const COMMON_NANS: [(i64, u64); 8] = [
    (NAN_FIRST - 2, 0x7FF0_0000_0000_0001),
    (NAN_FIRST - 3, 0x7FF4_0000_0000_0000),
    (NAN_FIRST - 4, 0x7FF4_0000_0000_0001),
    (NAN_FIRST - 5, 0x7FF8_0000_0000_0000),
    (NAN_FIRST - 6, 0x7FF8_0000_0000_0001),
    (NAN_FIRST - 7, 0x7FFC_0000_0000_0000),
    (NAN_FIRST - 8, 0x7FFC_0000_0000_0001),
    (NAN_FIRST - 9, 0x7FFF_FFFF_FFFF_FFFF),
];

/// Split a double into its (exponent, mantissa) wire pair.
pub fn split(v: f64) -> (i64, i64) {
    let bits = v.to_bits();
    let negative = bits & SIGN != 0;
    let magnitude = bits & !SIGN;
    let signed = |m: i64| if negative { -m } else { m };

    if bits == SIGN {
        return (NEG_ZERO, -1);
    }
    if magnitude == EXP_MASK {
        return (INF, signed(1));
    }
    if magnitude & EXP_MASK == EXP_MASK {
        if let Some(&(sentinel, _)) = COMMON_NANS.iter().find(|(_, p)| *p == magnitude) {
            return (sentinel, signed(1));
        }
        let payload = (magnitude & PAYLOAD_MASK) as i64;
        return if magnitude & QUIET_BIT != 0 {
            (QNAN, signed(payload))
        } else {
            (SNAN, signed(payload.max(1)))
        };
    }

    let biased = ((bits >> 52) & 0x7ff) as i64;
    let mut exponent = biased - BIAS;
    let mut mantissa = if biased == 0 {
        bits & FRAC_MASK
    } else {
        (bits & FRAC_MASK) | (1 << 52)
    };
    if mantissa == 0 {
        return (0, 0);
    }
    let zeros = mantissa.trailing_zeros();
    mantissa >>= zeros;
    exponent += i64::from(zeros);
    (exponent, signed(mantissa as i64))
}

/// Rebuild a double from its wire pair. `shift` counts mantissa bits the
/// varint decoder had to drop.
pub fn join(exponent: i64, mantissa: i64, shift: u32) -> Result<f64, DecodeError> {
    let negative = mantissa < 0;
    let sign = if negative { SIGN } else { 0 };
    let mut m = mantissa.unsigned_abs();

    if exponent == NEG_ZERO {
        return Ok(f64::from_bits(SIGN));
    }
    if exponent == INF {
        return Ok(f64::from_bits(sign | EXP_MASK));
    }
    if (NAN_LAST..=NAN_FIRST).contains(&exponent) {
        m = m.checked_shl(shift).unwrap_or(0);
        let mut bits = match COMMON_NANS.iter().find(|(s, _)| *s == exponent) {
            Some(&(_, pattern)) => pattern,
            None if exponent == QNAN => EXP_MASK | QUIET_BIT | (m & PAYLOAD_MASK),
            None => EXP_MASK | (m & PAYLOAD_MASK),
        };
        if bits & FRAC_MASK == 0 {
            // would read back as Inf
            bits |= 0x0004_0000_0000_0001;
        }
        return Ok(f64::from_bits(sign | bits));
    }

    let mut exponent = exponent.saturating_add(i64::from(shift));
    if m == 0 {
        return Ok(0.0);
    }
    while m >> 53 != 0 {
        m >>= 1;
        exponent = exponent.saturating_add(1);
    }
    // Move the top bit up to the implicit-bit position without going
    // below the subnormal exponent.
    let room = exponent.saturating_add(BIAS).max(0);
    let lead = i64::from(m.leading_zeros()) - 11;
    let up = lead.min(room);
    m <<= up;
    exponent -= up;

    if exponent > MAX_EXP {
        return Ok(f64::from_bits(sign | EXP_MASK));
    }
    if exponent < MIN_EXP {
        return Ok(f64::from_bits(sign));
    }
    if !(-BIAS..=971).contains(&exponent) {
        return Err(DecodeError::FloatRange(exponent));
    }
    let biased = if m & (1 << 52) != 0 {
        (exponent + BIAS) as u64
    } else {
        0
    };
    Ok(f64::from_bits(sign | (biased << 52) | (m & FRAC_MASK)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decoder, Encoder};

    fn roundtrip_bits(bits: u64) -> u64 {
        let mut enc = Encoder::new();
        enc.put_float(f64::from_bits(bits));
        Decoder::new(enc.as_bytes()).float().unwrap().to_bits()
    }

    #[test]
    fn test_special_values_exact() {
        let specials = [
            0x0000_0000_0000_0000u64,
            0x8000_0000_0000_0000,
            0x7FF0_0000_0000_0000,
            0xFFF0_0000_0000_0000,
            0x0000_0000_0000_0001,
            0x800F_FFFF_FFFF_FFFF,
            0x0010_0000_0000_0000,
            0x7FEF_FFFF_FFFF_FFFF,
            0xFFEF_FFFF_FFFF_FFFF,
        ];
        for bits in specials {
            assert_eq!(roundtrip_bits(bits), bits, "{bits:#018x}");
        }
    }

    #[test]
    fn test_every_nan_shape_exact() {
        let mut nans: Vec<u64> = COMMON_NANS.iter().map(|(_, p)| *p).collect();
        nans.extend([
            0x7FF0_0000_0000_0002,
            0x7FF0_DEAD_BEEF_0000,
            0x7FF8_0000_0000_0002,
            0x7FFB_1234_5678_9ABC,
            0x7FF7_FFFF_FFFF_FFFF,
        ]);
        for bits in nans {
            assert_eq!(roundtrip_bits(bits), bits, "{bits:#018x}");
            assert_eq!(roundtrip_bits(bits | SIGN), bits | SIGN, "{bits:#018x}");
        }
    }

    #[test]
    fn test_pseudo_random_patterns_exact() {
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..20_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            assert_eq!(roundtrip_bits(x), x, "{x:#018x}");
        }
    }

    #[test]
    fn test_encoded_sizes() {
        let size = |v: f64| {
            let mut enc = Encoder::new();
            enc.put_float(v);
            enc.len()
        };
        assert_eq!(size(1.0), 2);
        assert_eq!(size(-3.0), 2);
        assert_eq!(size(0.0), 2);
        assert_eq!(size(std::f64::consts::PI), 9);
    }

    #[test]
    fn test_out_of_range_exponents() {
        assert_eq!(join(MAX_EXP + 100, 3, 0).unwrap(), f64::INFINITY);
        assert_eq!(join(MAX_EXP + 100, -3, 0).unwrap(), f64::NEG_INFINITY);
        assert_eq!(join(MIN_EXP - 5, -3, 0).unwrap().to_bits(), SIGN);
        assert!(join(5000, 1, 0).is_err());
    }

    #[test]
    fn test_extreme_exponent_with_wide_mantissa() {
        let mut enc = Encoder::new();
        enc.put_sint(i64::MAX).put_sint(1 << 62);
        assert_eq!(Decoder::new(enc.as_bytes()).float().unwrap(), f64::INFINITY);

        let mut enc = Encoder::new();
        enc.put_sint(i64::MIN).put_sint(-(1 << 62));
        let v = Decoder::new(enc.as_bytes()).float().unwrap();
        assert_eq!(v.to_bits(), SIGN);

        assert_eq!(join(i64::MAX - 1, 1, u32::MAX).unwrap(), f64::INFINITY);
    }
}
