//! `bs430-scale-listener` library.
//!
//! Collects readings from a BS430 body-composition scale over BLE and
//! writes them to InfluxDB.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process
//! exit codes. The core logic lives in [`crate::app`], [`crate::lifecycle`]
//! and [`crate::writer`] where it can be tested deterministically with an
//! injected transport and backend.

pub mod address;
pub mod app;
pub mod config;
pub mod decoder;
pub mod epoch;
pub mod lifecycle;
pub mod measurement;
pub mod output;
pub mod session;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use address::DeviceAddress;
pub use config::{Config, ConfigError, parse_duration};
pub use decoder::{Characteristic, DecodeError, Decoded, decode};
pub use lifecycle::{Lifecycle, LifecycleConfig, State};
pub use measurement::Measurement;
pub use output::{Backend, BackendError, DataPoint};
pub use output::influxdb::InfluxDbBackend;
pub use session::{PersistPolicy, Session};
pub use transport::{Event, Transport, TransportError};
pub use writer::MetricWriter;
