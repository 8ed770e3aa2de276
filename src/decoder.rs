//! Decoder for the scale's characteristic values.
//!
//! The scale exposes one service with four characteristics. Three of them
//! indicate values:
//!
//! | Characteristic | Layout (byte offsets)                                            |
//! |----------------|------------------------------------------------------------------|
//! | weight         | 1-2 weight (u16 LE, 1/100 kg), 5-8 timestamp                     |
//! | body comp.     | 1-4 timestamp, 6-7 kCal (u16 LE), 8-15 fat/water/muscle/bone     |
//! | profile        | 2 profile id                                                     |
//!
//! Timestamps use the device epoch (see [`crate::epoch`]). The four body
//! composition fields are 12-bit values: the high nibble of each second byte
//! carries flags and is masked off before scaling by 1/10.
//!
//! The fourth characteristic takes the trigger command, see [`trigger_command`].

use crate::epoch;
use crate::measurement::Measurement;
use crate::session::{PersistPolicy, Session};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// 16-bit id of the scale's service.
pub const SERVICE_UUID: u16 = 0x78b2;

/// Command byte that makes the scale send its stored readings.
pub const TRIGGER_COMMAND: u8 = 0x02;

/// Summary returned for characteristics this decoder does not know.
pub const UNKNOWN_SUMMARY: &str = "unknown";

const WEIGHT_LEN: usize = 9;
const BODY_COMPOSITION_LEN: usize = 16;
const PROFILE_LEN: usize = 3;

/// The characteristics of the scale's service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Weight,
    BodyComposition,
    Command,
    Profile,
}

impl Characteristic {
    pub const ALL: [Characteristic; 4] = [
        Characteristic::Weight,
        Characteristic::BodyComposition,
        Characteristic::Command,
        Characteristic::Profile,
    ];

    pub fn uuid(self) -> u16 {
        match self {
            Characteristic::Weight => 0x8a21,
            Characteristic::BodyComposition => 0x8a22,
            Characteristic::Command => 0x8a81,
            Characteristic::Profile => 0x8a82,
        }
    }

    pub fn from_uuid(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.uuid())
    }
}

/// Error types for decoding characteristic values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed payload on {characteristic:04x}: expected at least {expected} bytes, got {actual}")]
    MalformedPayload {
        characteristic: u16,
        expected: usize,
        actual: usize,
    },
}

/// Result of decoding one characteristic value.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Human readable line for the log
    pub summary: String,
    pub measurements: Vec<Measurement>,
    /// Whether `measurements` should be handed to the writer
    pub persist: bool,
}

impl Decoded {
    fn summary_only(summary: String) -> Self {
        Decoded {
            summary,
            measurements: Vec::new(),
            persist: false,
        }
    }
}

/// Build the trigger command for `now`: the command byte followed by the
/// device-epoch clock.
pub fn trigger_command(now: SystemTime) -> Vec<u8> {
    let mut command = vec![TRIGGER_COMMAND];
    command.extend_from_slice(&epoch::encode(now));
    command
}

/// Decode a value received on characteristic `uuid`.
///
/// Updates `session` (profile, observation counters) and applies `policy` to
/// decide whether the resulting measurements are persisted.
///
/// # Arguments
/// * `uuid` - 16-bit id of the characteristic that sent `data`
/// * `data` - Raw characteristic value
/// * `session` - State of the connection the value arrived on
/// * `policy` - Read-last-N cap
///
/// # Returns
/// A log summary plus the measurements. Unknown characteristics yield the
/// [`UNKNOWN_SUMMARY`] and no measurements.
///
/// # Errors
/// Returns [`DecodeError::MalformedPayload`] if `data` is shorter than the
/// layout requires. The session counters are left untouched in that case.
pub fn decode(
    uuid: u16,
    data: &[u8],
    session: &mut Session,
    policy: PersistPolicy,
) -> Result<Decoded, DecodeError> {
    match Characteristic::from_uuid(uuid) {
        Some(Characteristic::Weight) => decode_weight(data, session, policy),
        Some(Characteristic::BodyComposition) => decode_body_composition(data, session, policy),
        Some(Characteristic::Profile) => decode_profile(data, session),
        Some(Characteristic::Command) | None => {
            Ok(Decoded::summary_only(UNKNOWN_SUMMARY.to_string()))
        }
    }
}

fn check_len(characteristic: Characteristic, data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::MalformedPayload {
            characteristic: characteristic.uuid(),
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// 12-bit value: second byte's high nibble masked off.
fn masked_tenths_at(data: &[u8], offset: usize) -> f64 {
    f64::from(u16::from_le_bytes([data[offset], data[offset + 1] & 0x0F])) / 10.0
}

fn timestamp_at(data: &[u8], offset: usize) -> SystemTime {
    epoch::decode([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn persist_marker(persist: bool) -> &'static str {
    if persist { "|P" } else { "|L" }
}

fn fmt_time(time: SystemTime) -> String {
    let secs = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("t={secs}")
}

fn decode_weight(
    data: &[u8],
    session: &mut Session,
    policy: PersistPolicy,
) -> Result<Decoded, DecodeError> {
    let characteristic = Characteristic::Weight;
    check_len(characteristic, data, WEIGHT_LEN)?;

    let tags = session.tags();
    let count = session.observe(characteristic.uuid());
    let persist = policy.should_persist(count);

    let weight = f64::from(u16_at(data, 1)) / 100.0;
    let timestamp = timestamp_at(data, 5);

    Ok(Decoded {
        summary: format!(
            "{}, weight:{weight:.1}{}",
            fmt_time(timestamp),
            persist_marker(persist)
        ),
        measurements: vec![Measurement::new("weight", timestamp, weight, tags)],
        persist,
    })
}

fn decode_body_composition(
    data: &[u8],
    session: &mut Session,
    policy: PersistPolicy,
) -> Result<Decoded, DecodeError> {
    let characteristic = Characteristic::BodyComposition;
    check_len(characteristic, data, BODY_COMPOSITION_LEN)?;

    let tags = session.tags();
    let count = session.observe(characteristic.uuid());
    let persist = policy.should_persist(count);

    let timestamp = timestamp_at(data, 1);
    let kcal = f64::from(u16_at(data, 6));
    let fat = masked_tenths_at(data, 8);
    let water = masked_tenths_at(data, 10);
    let muscle = masked_tenths_at(data, 12);
    let bone = masked_tenths_at(data, 14);

    let summary = format!(
        "{}, kCal:{kcal:.1} fat:{fat:.1} water:{water:.1} muscle:{muscle:.1} bone:{bone:.1}{}",
        fmt_time(timestamp),
        persist_marker(persist)
    );

    let measurements = [
        ("kCal", kcal),
        ("fat", fat),
        ("water", water),
        ("muscle", muscle),
        ("bone", bone),
    ]
    .into_iter()
    .map(|(name, value)| Measurement::new(name, timestamp, value, tags.clone()))
    .collect();

    Ok(Decoded {
        summary,
        measurements,
        persist,
    })
}

fn decode_profile(data: &[u8], session: &mut Session) -> Result<Decoded, DecodeError> {
    check_len(Characteristic::Profile, data, PROFILE_LEN)?;
    session.set_profile(data[2]);
    Ok(Decoded::summary_only(format!("profile={}", data[2])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PROFILE_UNKNOWN;
    use crate::test_utils::{
        TEST_ADDRESS, body_composition_payload, profile_payload, weight_payload,
    };

    const WEIGHT: u16 = 0x8a21;
    const BODY: u16 = 0x8a22;
    const PROFILE: u16 = 0x8a82;

    fn session() -> Session {
        Session::new(1, TEST_ADDRESS)
    }

    #[test]
    fn test_weight_round_trips_value_and_timestamp() {
        let time = epoch::to_system_time(446_990_400);
        for (kg, centi) in [(72.5, 7250), (0.1, 10), (150.0, 15000)] {
            let payload = weight_payload(centi, epoch::from_system_time(time));
            let decoded = decode(WEIGHT, &payload, &mut session(), PersistPolicy::unlimited()).unwrap();

            assert_eq!(decoded.measurements.len(), 1);
            let m = &decoded.measurements[0];
            assert_eq!(m.name, "weight");
            assert!((m.value - kg).abs() < 1e-9, "{} != {}", m.value, kg);
            assert_eq!(m.timestamp, time);
            assert!(decoded.persist);
        }
    }

    #[test]
    fn test_weight_summary_marks_persistence() {
        let mut session = session();
        let payload = weight_payload(8012, 0);
        let policy = PersistPolicy::new(1);

        let first = decode(WEIGHT, &payload, &mut session, policy).unwrap();
        assert!(first.summary.contains("weight:80.1"));
        assert!(first.summary.ends_with("|P"));

        let second = decode(WEIGHT, &payload, &mut session, policy).unwrap();
        assert!(second.summary.ends_with("|L"));
    }

    #[test]
    fn test_body_composition_yields_five_measurements() {
        let payload = body_composition_payload(1_000, 2_150, [215, 553, 401, 32], 0);
        let decoded = decode(BODY, &payload, &mut session(), PersistPolicy::unlimited()).unwrap();

        let values: Vec<(&str, f64)> = decoded
            .measurements
            .iter()
            .map(|m| (m.name, m.value))
            .collect();
        assert_eq!(
            values,
            vec![
                ("kCal", 2150.0),
                ("fat", 21.5),
                ("water", 55.3),
                ("muscle", 40.1),
                ("bone", 3.2),
            ]
        );
        let time = epoch::to_system_time(1_000);
        assert!(decoded.measurements.iter().all(|m| m.timestamp == time));
    }

    #[test]
    fn test_body_composition_masks_high_nibble() {
        let clean = body_composition_payload(1_000, 2_150, [215, 553, 401, 32], 0);
        let flagged = body_composition_payload(1_000, 2_150, [215, 553, 401, 32], 0xF);
        assert_ne!(clean, flagged);

        let a = decode(BODY, &clean, &mut session(), PersistPolicy::unlimited()).unwrap();
        let b = decode(BODY, &flagged, &mut session(), PersistPolicy::unlimited()).unwrap();
        assert_eq!(a.measurements, b.measurements);
    }

    #[test]
    fn test_profile_updates_session_without_measurements() {
        let mut session = session();
        let decoded = decode(PROFILE, &profile_payload(2), &mut session, PersistPolicy::new(1)).unwrap();

        assert_eq!(decoded.summary, "profile=2");
        assert!(decoded.measurements.is_empty());
        assert!(!decoded.persist);
        assert_eq!(session.profile(), 2);
        assert_eq!(session.count(PROFILE), 0);

        let weight = decode(WEIGHT, &weight_payload(7000, 0), &mut session, PersistPolicy::new(1)).unwrap();
        assert_eq!(weight.measurements[0].tags["profile"], "2");
    }

    #[test]
    fn test_tags_are_unknown_before_profile() {
        let decoded = decode(WEIGHT, &weight_payload(7000, 0), &mut session(), PersistPolicy::unlimited()).unwrap();
        let tags = &decoded.measurements[0].tags;
        assert_eq!(tags["profile"], "UNKNOWN");
        assert_eq!(tags["sensor"], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_read_last_two_persists_first_two_of_three() {
        let mut session = session();
        let policy = PersistPolicy::new(2);
        let payload = weight_payload(7000, 0);

        let flags: Vec<bool> = (0..3)
            .map(|_| decode(WEIGHT, &payload, &mut session, policy).unwrap().persist)
            .collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn test_unknown_characteristic_is_a_no_op() {
        let mut session = session();
        let decoded = decode(0x2a19, &[1, 2, 3], &mut session, PersistPolicy::unlimited()).unwrap();
        assert_eq!(decoded.summary, UNKNOWN_SUMMARY);
        assert!(decoded.measurements.is_empty());
        assert!(!decoded.persist);
        assert_eq!(session.profile(), PROFILE_UNKNOWN);
    }

    #[test]
    fn test_short_payloads_are_malformed() {
        let mut session = session();
        let err = decode(WEIGHT, &[0x1D, 0x50, 0x1C], &mut session, PersistPolicy::unlimited()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedPayload {
                characteristic: WEIGHT,
                expected: 9,
                actual: 3
            }
        );
        // Discarded payloads do not count towards the read-last cap
        assert_eq!(session.count(WEIGHT), 0);

        assert!(decode(BODY, &[0; 15], &mut session, PersistPolicy::unlimited()).is_err());
        assert!(decode(PROFILE, &[0; 2], &mut session, PersistPolicy::unlimited()).is_err());
        assert_eq!(session.profile(), PROFILE_UNKNOWN);
    }

    #[test]
    fn test_trigger_command_carries_device_clock() {
        let now = epoch::to_system_time(0x0A0B_0C0D);
        assert_eq!(trigger_command(now), vec![0x02, 0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn test_characteristic_uuid_lookup() {
        for c in Characteristic::ALL {
            assert_eq!(Characteristic::from_uuid(c.uuid()), Some(c));
        }
        assert_eq!(Characteristic::from_uuid(0x1234), None);
        assert_eq!(Characteristic::Weight.to_string(), "8a21");
    }
}
