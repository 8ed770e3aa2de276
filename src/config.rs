//! Runtime configuration.
//!
//! A [`Config`] starts from built-in defaults, may be replaced by a TOML file
//! and is then patched by command-line flags (see [`crate::app::Options`]).
//! [`Config::validate`] must pass before anything is started; an invalid
//! configuration is the only error that stops the process.

use crate::address::{DeviceAddress, ParseAddressError};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors detected while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("buffer configuration error: max_items ({max_items}) and max_wait_secs ({max_wait_secs}) must be > 0")]
    InvalidBuffer { max_items: i64, max_wait_secs: i64 },
    #[error("backend configuration error: '{0}' must not be empty")]
    MissingBackendField(&'static str),
    #[error("device '{device}': {source}")]
    InvalidAddress {
        device: String,
        source: ParseAddressError,
    },
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Time-series database connection settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    #[serde(alias = "db")]
    pub database: String,
    pub user: String,
    #[serde(alias = "pass")]
    pub password: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            host: "http://localhost:8086".to_string(),
            database: "test".to_string(),
            user: "user".to_string(),
            password: "pass".to_string(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("host", &self.host),
            ("database", &self.database),
            ("user", &self.user),
            ("password", &self.password),
        ];
        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(ConfigError::MissingBackendField(*name)),
            None => Ok(()),
        }
    }
}

/// Flush thresholds of the buffered writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Flush once this many points are queued
    pub max_items: i64,
    /// Flush a non-empty queue once this many seconds passed since the last flush
    pub max_wait_secs: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_items: 1000,
            max_wait_secs: 5,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_items > 0 && self.max_wait_secs > 0 {
            Ok(())
        } else {
            Err(ConfigError::InvalidBuffer {
                max_items: self.max_items,
                max_wait_secs: self.max_wait_secs,
            })
        }
    }

    /// Item threshold as a queue length. Only meaningful after [`validate`](Self::validate).
    pub fn max_items(&self) -> usize {
        usize::try_from(self.max_items).unwrap_or(usize::MAX)
    }

    /// Time threshold. Only meaningful after [`validate`](Self::validate).
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.max_wait_secs).unwrap_or(0))
    }
}

/// Fixed delays the scale needs around a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between stopping the scan and connecting
    #[serde(deserialize_with = "deserialize_duration")]
    pub settle: Duration,
    /// How long to stay connected collecting indications
    #[serde(deserialize_with = "deserialize_duration")]
    pub linger: Duration,
    /// Pause after a disconnect before scanning again
    #[serde(deserialize_with = "deserialize_duration")]
    pub cooldown: Duration,
    /// MTU requested after connecting
    pub mtu: u16,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            settle: Duration::from_millis(100),
            linger: Duration::from_secs(5),
            // The scale ignores connections for a while after it hangs up
            cooldown: Duration::from_secs(45),
            mtu: 500,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    /// Address of the scale
    #[serde(alias = "uuid")]
    pub device: String,
    /// Adapter index (`hciN`), negative selects the system default adapter
    #[serde(alias = "dev")]
    pub adapter: i32,
    /// Persist at most this many observations per characteristic and session, <= 0 for all
    pub read_last: i64,
    #[serde(alias = "db_conf")]
    pub backend: BackendConfig,
    pub buffer: BufferConfig,
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            device: "00:11:22:33:44:55".to_string(),
            adapter: -1,
            read_last: 1,
            backend: BackendConfig::default(),
            buffer: BufferConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Config {
    /// Read a TOML configuration file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parsed target address.
    pub fn device_address(&self) -> Result<DeviceAddress, ConfigError> {
        self.device
            .parse()
            .map_err(|source| ConfigError::InvalidAddress {
                device: self.device.clone(),
                source,
            })
    }

    /// Check every setting that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_address()?;
        self.backend.validate()?;
        self.buffer.validate()
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use bs430_scale_listener::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
/// assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let parse = |num: &str, unit: &str| -> Result<u64, String> {
        num.trim()
            .parse()
            .map_err(|_| format!("invalid {unit}: {num}"))
    };

    let scaled = |num: &str, unit: &str, secs: u64| -> Result<Duration, String> {
        parse(num, unit)?
            .checked_mul(secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("{unit} out of range: {num}"))
    };

    // `ms` must be checked before `m` and `s`
    if let Some(num) = src.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse(num, "milliseconds")?));
    }
    if let Some(num) = src.strip_suffix('h') {
        return scaled(num, "hours", 3600);
    }
    if let Some(num) = src.strip_suffix('m') {
        return scaled(num, "minutes", 60);
    }
    if let Some(num) = src.strip_suffix('s') {
        return Ok(Duration::from_secs(parse(num, "seconds")?));
    }

    Ok(Duration::from_secs(parse(src, "duration")?))
}
