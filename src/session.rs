//! Per-connection state.
//!
//! A [`Session`] lives from a successful connect until the matching
//! disconnect. It records the active user profile reported by the scale and
//! how many values each characteristic has delivered, which drives the
//! read-last-N persistence cap ([`PersistPolicy`]).

use crate::address::DeviceAddress;
use crate::measurement::Tags;
use std::collections::HashMap;

/// Profile value before the scale has reported one.
pub const PROFILE_UNKNOWN: u8 = u8::MAX;

/// Identifies one connection; notifications carry it so stale deliveries
/// from an earlier connection can be recognised and dropped.
pub type SessionId = u64;

/// Caps how many observations per characteristic are persisted in one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistPolicy {
    read_last: i64,
}

impl PersistPolicy {
    /// Create a policy from the configured read-last value.
    ///
    /// `read_last <= 0` persists everything.
    pub fn new(read_last: i64) -> Self {
        Self { read_last }
    }

    pub fn unlimited() -> Self {
        Self { read_last: 0 }
    }

    /// Whether the `count`-th observation (1-based) should be persisted.
    pub fn should_persist(&self, count: u32) -> bool {
        self.read_last <= 0 || i64::from(count) <= self.read_last
    }
}

/// Mutable state of one connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    sensor: DeviceAddress,
    profile: u8,
    counts: HashMap<u16, u32>,
}

impl Session {
    /// Start a session for `sensor` with the profile unknown and all counters at zero.
    pub fn new(id: SessionId, sensor: DeviceAddress) -> Self {
        Session {
            id,
            sensor,
            profile: PROFILE_UNKNOWN,
            counts: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn sensor(&self) -> DeviceAddress {
        self.sensor
    }

    pub fn profile(&self) -> u8 {
        self.profile
    }

    pub fn set_profile(&mut self, profile: u8) {
        self.profile = profile;
    }

    /// Number of observations seen so far for a characteristic.
    pub fn count(&self, characteristic: u16) -> u32 {
        self.counts.get(&characteristic).copied().unwrap_or(0)
    }

    /// Record one more observation and return the new count.
    pub fn observe(&mut self, characteristic: u16) -> u32 {
        let count = self.counts.entry(characteristic).or_insert(0);
        *count += 1;
        *count
    }

    /// Tags for measurements decoded in this session.
    pub fn tags(&self) -> Tags {
        let profile = if self.profile == PROFILE_UNKNOWN {
            "UNKNOWN".to_string()
        } else {
            self.profile.to_string()
        };

        let mut tags = Tags::new();
        tags.insert("sensor".to_string(), self.sensor.to_string());
        tags.insert("profile".to_string(), profile);
        tags
    }
}
