use std::sync::LazyLock;

const TABLE_LEN: usize = 1 << 16;

static HALF_TABLE: LazyLock<HalfTable> = LazyLock::new(HalfTable::new);

/// Process-wide decode table, built on first use.
pub fn half_table() -> &'static HalfTable {
    &HALF_TABLE
}

/// Decodes an IEEE-754 binary16 bit pattern into the f32 with the same value.
pub fn decode_half(bits: u16) -> f32 {
    let negative = bits & 0x8000 != 0;
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x03ff) as f32;

    let magnitude = match exponent {
        // subnormal
        0 => 2f32.powi(-14) * (mantissa / 1024.0),
        0x1f if mantissa != 0.0 => return f32::NAN,
        0x1f => f32::INFINITY,
        e => 2f32.powi(e - 15) * (1.0 + mantissa / 1024.0),
    };

    if negative { -magnitude } else { magnitude }
}

/// Lookup table over all 65536 half-float patterns.
pub struct HalfTable {
    values: Box<[f32; TABLE_LEN]>,
}

impl HalfTable {
    pub fn new() -> Self {
        let values: Vec<f32> = (0..=u16::MAX).map(decode_half).collect();
        let values = values
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!("u16 range has {TABLE_LEN} entries"));
        Self { values }
    }

    #[inline]
    pub fn decode(&self, bits: u16) -> f32 {
        self.values[bits as usize]
    }
}

impl Default for HalfTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-level binary16 -> binary32 widening, independent of `decode_half`.
    fn reference(bits: u16) -> f32 {
        let sign = ((bits as u32) & 0x8000) << 16;
        let exponent = ((bits >> 10) & 0x1f) as u32;
        let mantissa = (bits & 0x03ff) as u32;
        match exponent {
            0 => {
                let magnitude = mantissa as f32 * (1.0 / 16_777_216.0);
                f32::from_bits(magnitude.to_bits() | sign)
            }
            0x1f if mantissa != 0 => f32::NAN,
            0x1f => f32::from_bits(sign | 0x7f80_0000),
            e => f32::from_bits(sign | ((e + 127 - 15) << 23) | (mantissa << 13)),
        }
    }

    #[test]
    fn known_values() {
        assert_eq!(decode_half(0x0000), 0.0);
        assert_eq!(decode_half(0x3c00), 1.0);
        assert_eq!(decode_half(0xbc00), -1.0);
        assert_eq!(decode_half(0x4000), 2.0);
        assert_eq!(decode_half(0x3800), 0.5);
        assert_eq!(decode_half(0x7bff), 65504.0);
        assert_eq!(decode_half(0x0001), 2f32.powi(-24));
        assert_eq!(decode_half(0x7c00), f32::INFINITY);
        assert_eq!(decode_half(0xfc00), f32::NEG_INFINITY);
        assert!(decode_half(0x7c01).is_nan());
        assert!(decode_half(0xfe00).is_nan());
    }

    #[test]
    fn negative_zero_keeps_sign() {
        let v = decode_half(0x8000);
        assert_eq!(v, 0.0);
        assert!(v.is_sign_negative());
    }

    #[test]
    fn table_matches_reference_for_every_pattern() {
        let table = HalfTable::new();
        for bits in 0..=u16::MAX {
            let expected = reference(bits);
            let got = table.decode(bits);
            if expected.is_nan() {
                assert!(got.is_nan(), "{bits:#06x} should be NaN, got {got}");
                assert_eq!((bits >> 10) & 0x1f, 0x1f);
            } else {
                assert_eq!(
                    got.to_bits(),
                    expected.to_bits(),
                    "{bits:#06x}: got {got}, expected {expected}"
                );
            }
        }
    }

    #[test]
    fn shared_table_is_built_once() {
        let a = half_table() as *const HalfTable;
        let b = crate::init() as *const HalfTable;
        assert_eq!(a, b);
    }
}
