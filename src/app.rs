//! Core application runner for `bs430-scale-listener`.
//!
//! This module is decoupled from process setup and exit codes so it can be
//! tested with an injected Bluetooth platform and database backend.

use crate::config::{Config, ConfigError, parse_duration};
use crate::lifecycle::{Lifecycle, LifecycleConfig};
use crate::output::Backend;
use crate::output::influxdb::InfluxDbBackend;
use crate::session::PersistPolicy;
use crate::transport::{Event, Transport, TransportError, TransportFuture};
use crate::writer::MetricWriter;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Command-line options. Every value given here overrides the configuration file.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, about, version)]
pub struct Options {
    /// Read settings from a TOML file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log state transitions and raw payloads
    #[arg(short, long)]
    pub debug: bool,

    /// Persist only the first N observations per characteristic and connection.
    /// Zero or a negative value persists everything.
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    pub read_last: Option<i64>,

    /// Bluetooth adapter index (hciN); negative selects the default adapter
    #[arg(long, allow_hyphen_values = true)]
    pub adapter: Option<i32>,

    /// InfluxDB base URL
    #[arg(long, value_name = "URL")]
    pub influxdb_host: Option<String>,

    #[arg(long, value_name = "NAME")]
    pub influxdb_db: Option<String>,

    #[arg(long, value_name = "USER")]
    pub influxdb_user: Option<String>,

    #[arg(long, value_name = "PASSWORD")]
    pub influxdb_pass: Option<String>,

    /// Flush once this many points are queued
    #[arg(long, allow_hyphen_values = true)]
    pub max_items: Option<i64>,

    /// Flush queued points after this many seconds
    #[arg(long, value_name = "SECS", allow_hyphen_values = true)]
    pub max_wait: Option<i64>,

    /// Pause between stopping the scan and connecting.
    /// Accepts duration with suffix: 100ms, 3s, 1m, 2h.
    #[arg(long, value_parser = parse_duration)]
    pub settle: Option<Duration>,

    /// How long to stay connected after triggering the scale
    #[arg(long, value_parser = parse_duration)]
    pub linger: Option<Duration>,

    /// Pause after a disconnect before scanning again
    #[arg(long, value_parser = parse_duration)]
    pub cooldown: Option<Duration>,

    /// Address of the scale, e.g. C4:7C:8D:6A:01:FF
    #[arg(value_name = "DEVICE")]
    pub device: Option<String>,
}

impl Options {
    /// Patch `config` with the values given on the command line.
    pub fn apply(&self, mut config: Config) -> Config {
        config.debug |= self.debug;
        if let Some(read_last) = self.read_last {
            config.read_last = read_last;
        }
        if let Some(adapter) = self.adapter {
            config.adapter = adapter;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }

        let backend = &mut config.backend;
        for (value, target) in [
            (&self.influxdb_host, &mut backend.host),
            (&self.influxdb_db, &mut backend.database),
            (&self.influxdb_user, &mut backend.user),
            (&self.influxdb_pass, &mut backend.password),
        ] {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        if let Some(max_items) = self.max_items {
            config.buffer.max_items = max_items;
        }
        if let Some(max_wait) = self.max_wait {
            config.buffer.max_wait_secs = max_wait;
        }
        if let Some(settle) = self.settle {
            config.timing.settle = settle;
        }
        if let Some(linger) = self.linger {
            config.timing.linger = linger;
        }
        if let Some(cooldown) = self.cooldown {
            config.timing.cooldown = cooldown;
        }
        config
    }

    /// Load the configuration file (if any), apply overrides and validate.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let base = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let config = self.apply(base);
        config.validate()?;
        Ok(config)
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An opened transport and the receiver of its events.
pub type Opened = (Arc<dyn Transport>, mpsc::Receiver<Event>);

/// Bluetooth stack abstraction to enable deterministic unit tests without hardware.
pub trait Platform: Send + Sync {
    fn open(&self, adapter: i32) -> TransportFuture<'_, Opened>;
}

/// Real platform that delegates to the compiled-in backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct BluetoothPlatform;

impl Platform for BluetoothPlatform {
    fn open(&self, adapter: i32) -> TransportFuture<'_, Opened> {
        Box::pin(open_bluetooth(adapter))
    }
}

#[cfg(feature = "bluer")]
async fn open_bluetooth(adapter: i32) -> Result<Opened, TransportError> {
    let (transport, events) = crate::transport::bluer::BluerTransport::open(adapter).await?;
    let transport: Arc<dyn Transport> = Arc::new(transport);
    Ok((transport, events))
}

#[cfg(not(feature = "bluer"))]
async fn open_bluetooth(_adapter: i32) -> Result<Opened, TransportError> {
    Err(TransportError::Bluetooth(
        "no Bluetooth backend compiled in (enable the `bluer` feature)".to_string(),
    ))
}

/// Run until the transport closes its event channel.
///
/// Starts the periodic flush task, drives the connection lifecycle and
/// attempts a last flush of whatever is still queued on the way out.
///
/// # Errors
/// Returns [`RunError::Config`] for an unparsable device address and
/// [`RunError::Transport`] if the platform cannot be opened.
pub async fn run_with(
    config: Config,
    platform: &dyn Platform,
    backend: Arc<dyn Backend>,
) -> Result<(), RunError> {
    let target = config.device_address()?;
    let writer = MetricWriter::new(backend, config.buffer);
    let (transport, events) = platform.open(config.adapter).await?;

    let flusher = writer.start();
    let lifecycle = Lifecycle::new(
        transport,
        events,
        writer.clone(),
        LifecycleConfig {
            target,
            policy: PersistPolicy::new(config.read_last),
            timing: config.timing,
            debug: config.debug,
        },
    );
    info!("Waiting for {target}");
    lifecycle.run().await;

    flusher.abort();
    if let Err(e) = writer.flush().await {
        error!("Dropping {} unsaved points: {e}", writer.len());
    }
    Ok(())
}

/// Run against the real Bluetooth stack and InfluxDB.
pub async fn run(config: Config) -> Result<(), RunError> {
    let backend = InfluxDbBackend::new(&config.backend);
    info!("Writing to {}", backend.url());
    run_with(config, &BluetoothPlatform, Arc::new(backend)).await
}
