//! Decoded scale measurement.

use std::collections::BTreeMap;
use std::time::SystemTime;

/// Tag set attached to every measurement (`sensor`, `profile`).
pub type Tags = BTreeMap<String, String>;

/// A single value read from the scale.
///
/// Units follow the device:
/// - `weight` in kilograms
/// - `kCal` in kilocalories
/// - `fat`, `water`, `muscle` in percent
/// - `bone` in kilograms
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Series name, e.g. `weight` or `fat`
    pub name: &'static str,
    /// Time the scale recorded the value (device clock)
    pub timestamp: SystemTime,
    pub value: f64,
    pub tags: Tags,
}

impl Measurement {
    pub fn new(name: &'static str, timestamp: SystemTime, value: f64, tags: Tags) -> Self {
        Self {
            name,
            timestamp,
            value,
            tags,
        }
    }
}
