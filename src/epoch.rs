//! The scale's timestamp format.
//!
//! The device counts seconds from 2010-01-01T00:00:00Z and sends them as a
//! little-endian `u32`. The same format is used in both directions: for
//! decoding measurement timestamps and for the clock value sent with the
//! trigger command.

use std::time::{Duration, SystemTime};

/// Seconds between the Unix epoch and 2010-01-01T00:00:00Z.
pub const EPOCH_2010_UNIX_SECS: u64 = 1_262_304_000;

/// Convert a device second count into wall-clock time.
pub fn to_system_time(secs: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(EPOCH_2010_UNIX_SECS + u64::from(secs))
}

/// Convert wall-clock time into a device second count.
///
/// Times before 2010 clamp to zero and times past the `u32` range clamp to
/// `u32::MAX`.
pub fn from_system_time(time: SystemTime) -> u32 {
    let unix = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(unix.saturating_sub(EPOCH_2010_UNIX_SECS)).unwrap_or(u32::MAX)
}

/// Decode four little-endian bytes into a timestamp.
pub fn decode(bytes: [u8; 4]) -> SystemTime {
    to_system_time(u32::from_le_bytes(bytes))
}

/// Encode a timestamp as four little-endian bytes.
pub fn encode(time: SystemTime) -> [u8; 4] {
    from_system_time(time).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_start_of_2010() {
        let start = decode([0, 0, 0, 0]);
        assert_eq!(
            start.duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_secs(1_262_304_000)
        );
    }

    #[test]
    fn test_encodes_little_endian() {
        let time = to_system_time(0x0102_0304);
        assert_eq!(encode(time), [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_round_trips_device_seconds() {
        // 2024-03-01T12:00:00Z
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_709_294_400);
        assert_eq!(decode(encode(time)), time);
    }

    #[test]
    fn test_clamps_times_before_2010() {
        assert_eq!(from_system_time(SystemTime::UNIX_EPOCH), 0);
    }
}
