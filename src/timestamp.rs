//! NTP wire timestamps.
//!
//! An [`NtpTimestamp`] is a (seconds, fraction) pair: seconds since
//! 1900-01-01 in era 0 and a 32-bit binary fraction (2^32 counts = 1 s).
//! Arithmetic on the seconds field is modular.

use serde::Serialize;

/// NTP epoch offset from Unix epoch (1900-01-01 to 1970-01-01 in seconds)
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const MICROS_PER_SEC: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const fn new(seconds: u32, fraction: u32) -> Self {
        NtpTimestamp { seconds, fraction }
    }

    /// Build from Unix seconds and a sub-second part in nanoseconds.
    pub fn from_unix_nanos(unix_secs: i64, sub_ns: u32) -> Self {
        let ntp_secs = (unix_secs as u64).wrapping_add(NTP_UNIX_OFFSET);
        // frac = nanos * 2^32 / 10^9
        let frac = ((sub_ns.min(999_999_999) as u64) << 32) / NANOS_PER_SEC;
        NtpTimestamp {
            seconds: ntp_secs as u32,
            fraction: frac as u32,
        }
    }

    pub fn from_unix_micros(unix_secs: i64, sub_us: u32) -> Self {
        let frac = ((sub_us.min(999_999) as u64) << 32) / MICROS_PER_SEC;
        NtpTimestamp {
            seconds: (unix_secs as u64).wrapping_add(NTP_UNIX_OFFSET) as u32,
            fraction: frac as u32,
        }
    }

    /// Unix seconds, assuming NTP era 0.
    pub fn unix_seconds(&self) -> i64 {
        self.seconds as i64 - NTP_UNIX_OFFSET as i64
    }

    /// Fraction expressed in nanoseconds (truncating).
    pub fn subsec_nanos(&self) -> u32 {
        ((self.fraction as u64 * NANOS_PER_SEC) >> 32) as u32
    }

    pub fn subsec_micros(&self) -> u32 {
        ((self.fraction as u64 * MICROS_PER_SEC) >> 32) as u32
    }

    /// Same instant with the fraction dropped.
    pub fn whole_seconds(&self) -> Self {
        NtpTimestamp {
            seconds: self.seconds,
            fraction: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.seconds.to_be_bytes());
        out[4..].copy_from_slice(&self.fraction.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        NtpTimestamp {
            seconds: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            fraction: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Signed difference `self - other` in nanoseconds, modulo the 2^32 s era.
    pub fn wrapping_diff_nanos(&self, other: &NtpTimestamp) -> i64 {
        let a = ((self.seconds as u64) << 32) | self.fraction as u64;
        let b = ((other.seconds as u64) << 32) | other.fraction as u64;
        let diff = a.wrapping_sub(b) as i64;
        // 32.32 fixed point -> ns
        ((diff as i128 * NANOS_PER_SEC as i128) >> 32) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_epoch_maps_to_ntp_offset() {
        let ts = NtpTimestamp::from_unix_nanos(0, 0);
        assert_eq!(ts.seconds as u64, NTP_UNIX_OFFSET);
        assert_eq!(ts.unix_seconds(), 0);
    }

    #[test]
    fn test_half_second_fraction() {
        let ts = NtpTimestamp::from_unix_micros(1_700_000_000, 500_000);
        assert_eq!(ts.fraction, 0x8000_0000);
        assert_eq!(ts.subsec_micros(), 500_000);
    }

    #[test]
    fn test_quarter_second_from_nanos() {
        let ts = NtpTimestamp::from_unix_nanos(10, 250_000_000);
        assert_eq!(ts.fraction, 0x4000_0000);
    }

    #[test]
    fn test_byte_layout_is_big_endian() {
        let ts = NtpTimestamp::new(0xDEAD_BEEF, 0xCAFE_BABE);
        assert_eq!(ts.to_bytes(), [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE]);
        assert_eq!(NtpTimestamp::from_bytes(ts.to_bytes()), ts);
    }

    #[test]
    fn test_wrapping_diff_across_era_boundary() {
        let before = NtpTimestamp::new(u32::MAX, 0x8000_0000);
        let after = NtpTimestamp::new(0, 0);
        assert_eq!(after.wrapping_diff_nanos(&before), 500_000_000);
        assert_eq!(before.wrapping_diff_nanos(&after), -500_000_000);
    }
}
