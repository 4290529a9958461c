//! Conversions between macro clock periods (MCLKs), microseconds and the
//! sensor's encoded timeout register format.
//!
//! These are pure functions; they never touch the bus. The rounding of every
//! conversion matches what the sensor firmware expects, so keep the
//! `+ half / 2` biases exactly where they are.

/// Macro period length in VCSEL clocks.
const MACRO_PERIOD_VCLKS: u32 = 2304;
/// PLL period in picoseconds.
const PLL_PERIOD_PS: u32 = 1655;

/// Decode a sequence step timeout in MCLKs from its register value.
///
/// The register format is `(LSByte * 2^MSByte) + 1`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode_timeout(reg_val: u16) -> u16 {
    let ls_byte = u32::from(reg_val & 0x00FF);
    let ms_byte = u32::from(reg_val >> 8);

    (ls_byte.checked_shl(ms_byte).unwrap_or(0) + 1) as u16
}

/// Encode a sequence step timeout in MCLKs into its register value.
///
/// The encoding is lossy: decoding the result never yields more than
/// `timeout_mclks`. Zero encodes to zero.
#[must_use]
pub fn encode_timeout(timeout_mclks: u16) -> u16 {
    if timeout_mclks == 0 {
        return 0;
    }

    let mut ls_byte = timeout_mclks - 1;
    let mut ms_byte: u16 = 0;

    while ls_byte > 0xFF {
        ls_byte >>= 1;
        ms_byte += 1;
    }

    (ms_byte << 8) | ls_byte
}

/// Macro period in nanoseconds for a VCSEL period given in PCLKs.
#[must_use]
pub fn macro_period_ns(vcsel_period_pclks: u8) -> u32 {
    ((MACRO_PERIOD_VCLKS * u32::from(vcsel_period_pclks) * PLL_PERIOD_PS) + 500) / 1000
}

/// Convert a timeout from MCLKs to microseconds at the given VCSEL period.
#[must_use]
pub fn mclks_to_us(timeout_period_mclks: u16, vcsel_period_pclks: u8) -> u32 {
    let macro_period_ns = u64::from(macro_period_ns(vcsel_period_pclks));

    let us = (u64::from(timeout_period_mclks) * macro_period_ns + macro_period_ns / 2) / 1000;
    u32::try_from(us).unwrap_or(u32::MAX)
}

/// Convert a timeout from microseconds to MCLKs at the given VCSEL period.
///
/// Returns 0 for a VCSEL period so short that its macro period rounds to
/// zero.
#[must_use]
pub fn us_to_mclks(timeout_period_us: u32, vcsel_period_pclks: u8) -> u32 {
    let macro_period_ns = u64::from(macro_period_ns(vcsel_period_pclks));

    let mclks = (u64::from(timeout_period_us) * 1000 + macro_period_ns / 2)
        .checked_div(macro_period_ns)
        .unwrap_or(0);
    u32::try_from(mclks).unwrap_or(u32::MAX)
}

/// Decode a VCSEL pulse period in PCLKs from its register value.
#[must_use]
pub fn decode_vcsel_period(reg_val: u8) -> u8 {
    reg_val.wrapping_add(1) << 1
}

/// Encode a VCSEL pulse period in PCLKs into its register value. Only
/// meaningful for the even periods the sensor accepts.
#[must_use]
pub fn encode_vcsel_period(period_pclks: u8) -> u8 {
    (period_pclks >> 1).wrapping_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_register_values() {
        // Pre-range and final-range defaults left by the tuning settings.
        assert_eq!(decode_timeout(0x0096), 151);
        assert_eq!(decode_timeout(0x01FE), 509);
        assert_eq!(decode_timeout(0x0000), 1);
    }

    #[test]
    fn encode_picks_smallest_exponent() {
        assert_eq!(encode_timeout(0), 0);
        assert_eq!(encode_timeout(1), 0x0000);
        assert_eq!(encode_timeout(256), 0x00FF);
        assert_eq!(encode_timeout(257), 0x0180);
        assert_eq!(encode_timeout(509), 0x01FE);
        assert_eq!(encode_timeout(594), 0x0294);
    }

    #[test]
    fn encode_decode_never_grows() {
        for mclks in 1..=u16::MAX {
            let decoded = decode_timeout(encode_timeout(mclks));
            assert!(decoded <= mclks, "{mclks} decoded as {decoded}");
            if mclks <= 256 {
                assert_eq!(decoded, mclks);
            }
        }
    }

    #[test]
    fn macro_period_is_strictly_increasing() {
        assert_eq!(macro_period_ns(10), 38131);
        assert_eq!(macro_period_ns(14), 53384);

        for pclks in 1..u8::MAX {
            assert!(macro_period_ns(pclks + 1) > macro_period_ns(pclks));
        }
    }

    #[test]
    fn mclk_microsecond_conversions_round_half_up() {
        assert_eq!(mclks_to_us(38, 14), 2055);
        assert_eq!(mclks_to_us(151, 14), 8087);
        assert_eq!(mclks_to_us(358, 10), 13669);

        assert_eq!(us_to_mclks(16904, 10), 443);
        assert_eq!(us_to_mclks(8087, 14), 151);
    }

    #[test]
    fn conversions_do_not_overflow() {
        assert_eq!(mclks_to_us(u16::MAX, 18), 4_498_094);
        assert!(us_to_mclks(u32::MAX, 8) > 0);
        assert_eq!(us_to_mclks(1000, 0), 0);
    }

    #[test]
    fn vcsel_period_codec() {
        assert_eq!(decode_vcsel_period(0x06), 14);
        assert_eq!(decode_vcsel_period(0x04), 10);
        for pclks in [8, 10, 12, 14, 16, 18] {
            assert_eq!(decode_vcsel_period(encode_vcsel_period(pclks)), pclks);
        }
    }
}
