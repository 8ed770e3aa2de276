//! Connection lifecycle of the scale.
//!
//! ```text
//! PoweredOff -> Scanning -> Connecting -> ServiceDiscovery -> Subscribing
//!     ^            ^                                              |
//!     |            |                                              v
//!     +------- CoolingDown <- Disconnecting <- Lingering <- Triggering
//! ```
//!
//! One [`Lifecycle`] owns the event receiver and processes events strictly one
//! at a time. A session (connect to disconnect) runs inline: the state
//! machine connects, discovers the scale's service and characteristics,
//! subscribes to indications, writes the trigger command and then lingers,
//! decoding every indication that arrives, before disconnecting and cooling
//! down. The scale refuses new connections for a while after a disconnect,
//! hence the cool-down before scanning resumes.

use crate::address::DeviceAddress;
use crate::config::TimingConfig;
use crate::decoder::{self, Characteristic, SERVICE_UUID};
use crate::session::{PersistPolicy, Session, SessionId};
use crate::transport::{Event, Properties, Transport};
use crate::writer::MetricWriter;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout_at};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    PoweredOff,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Subscribing,
    Triggering,
    Lingering,
    Disconnecting,
    CoolingDown,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Settings that do not change over the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub target: DeviceAddress,
    pub policy: PersistPolicy,
    pub timing: TimingConfig,
    /// Log raw payloads next to their summaries
    pub debug: bool,
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Done,
    Disconnected,
}

/// State machine for one target device.
pub struct Lifecycle {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<Event>,
    writer: MetricWriter,
    config: LifecycleConfig,
    state: State,
    powered: bool,
    session: Option<Session>,
    last_session: SessionId,
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Lifecycle {
    /// Create a state machine in [`State::PoweredOff`].
    ///
    /// # Arguments
    /// * `transport` - BLE stack driven by the state machine
    /// * `events` - Receiver for the events `transport` reports
    /// * `writer` - Destination of persisted measurements
    /// * `config` - Target device, read-last policy and delays
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<Event>,
        writer: MetricWriter,
        config: LifecycleConfig,
    ) -> Self {
        Lifecycle {
            transport,
            events,
            writer,
            config,
            state: State::PoweredOff,
            powered: false,
            session: None,
            last_session: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn transition(&mut self, state: State) {
        debug!("{} -> {}", self.state, state);
        self.state = state;
    }

    /// Process events until the transport closes the channel.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event).await;
        }
        info!("Event channel closed, stopping");
    }

    /// Process one event.
    pub async fn handle(&mut self, event: Event) {
        match event {
            Event::AdapterPowered(powered) => self.on_power(powered).await,
            Event::Discovered {
                address,
                name,
                rssi,
            } => {
                if self.state != State::Scanning || address != self.config.target {
                    return;
                }
                // Without a signal strength the device was remembered, not heard
                let Some(rssi) = rssi else {
                    debug!("{address} known but not advertising, waiting");
                    return;
                };
                info!(
                    "Discovered dev ID:{address}, NAME:({}), RSSI:{rssi}",
                    name.as_deref().unwrap_or("")
                );
                self.connect_and_run().await;
            }
            Event::Disconnected => debug!("Disconnect while {}, ignoring", self.state),
            Event::Notification {
                session,
                characteristic,
                value,
            } => self.on_notification(session, characteristic, &value),
        }
    }

    async fn on_power(&mut self, powered: bool) {
        info!("Adapter powered: {powered}");
        self.powered = powered;
        match (powered, self.state) {
            (true, State::PoweredOff) => self.start_scanning().await,
            (false, State::Scanning) => {
                if let Err(e) = self.transport.stop_scan().await {
                    warn!("Failed to stop scanning: {e}");
                }
                self.transition(State::PoweredOff);
            }
            _ => {}
        }
    }

    async fn start_scanning(&mut self) {
        match self.transport.start_scan().await {
            Ok(()) => {
                info!("Scanning...");
                self.transition(State::Scanning);
            }
            Err(e) => {
                error!("Failed to start scanning: {e}");
                self.transition(State::PoweredOff);
            }
        }
    }

    async fn connect_and_run(&mut self) {
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scanning: {e}");
        }
        // Some host stacks fail to connect right after the scan stops
        sleep(self.config.timing.settle).await;

        self.transition(State::Connecting);
        match self.transport.connect(self.config.target).await {
            Ok(()) => {
                info!("Connected {}", self.config.target);
                let end = self.run_session().await;
                self.close_session(end).await;
            }
            Err(e) => {
                error!("Failed to connect {}: {e}", self.config.target);
                self.close_session(SessionEnd::Disconnected).await;
            }
        }
    }

    /// Discover, subscribe, trigger and linger. Returns how the session ended.
    async fn run_session(&mut self) -> SessionEnd {
        self.last_session += 1;
        self.session = Some(Session::new(self.last_session, self.config.target));
        self.transition(State::ServiceDiscovery);

        match self.transport.negotiate_mtu(self.config.timing.mtu).await {
            Ok(mtu) => debug!("MTU {mtu}"),
            Err(e) => warn!("Failed to set MTU, err: {e}"),
        }

        if let Err(e) = self.transport.discover_service(SERVICE_UUID).await {
            error!("Failed to discover services, err: {e}");
            return SessionEnd::Done;
        }

        let mut characteristics = Vec::new();
        for characteristic in Characteristic::ALL {
            match self.transport.discover_characteristic(characteristic.uuid()).await {
                Ok(properties) => {
                    debug!("Characteristic: {characteristic} Props: {properties:?}");
                    characteristics.push((characteristic, properties));
                }
                Err(e) => warn!("Failed to discover characteristic {characteristic}, err: {e}"),
            }
        }

        self.subscribe(&characteristics).await;
        self.trigger(&characteristics).await;
        self.linger().await
    }

    async fn subscribe(&mut self, characteristics: &[(Characteristic, Properties)]) {
        self.transition(State::Subscribing);
        for (characteristic, _) in characteristics.iter().filter(|(_, p)| p.subscribable()) {
            let uuid = characteristic.uuid();
            if let Err(e) = self.transport.discover_descriptors(uuid).await {
                warn!("Failed to discover descriptors of {characteristic}, err: {e}");
                continue;
            }
            if let Err(e) = self.transport.subscribe(uuid, self.last_session).await {
                warn!("Failed to subscribe indicate {characteristic}, err: {e}");
            }
        }
    }

    async fn trigger(&mut self, characteristics: &[(Characteristic, Properties)]) {
        self.transition(State::Triggering);
        for (characteristic, properties) in characteristics.iter().filter(|(_, p)| p.writable()) {
            let command = decoder::trigger_command(SystemTime::now());
            if self.config.debug {
                debug!("Writing cmd {} to {characteristic}", hex(&command));
            }
            if let Err(e) = self
                .transport
                .write(characteristic.uuid(), command, properties.write)
                .await
            {
                warn!("Failed to write to characteristic {characteristic}, err: {e}");
            }
        }
    }

    /// Handle indications until the linger window closes or the device hangs up.
    async fn linger(&mut self) -> SessionEnd {
        self.transition(State::Lingering);
        let deadline = Instant::now() + self.config.timing.linger;
        loop {
            match timeout_at(deadline, self.events.recv()).await {
                Err(_) | Ok(None) => return SessionEnd::Done,
                Ok(Some(Event::Notification {
                    session,
                    characteristic,
                    value,
                })) => self.on_notification(session, characteristic, &value),
                Ok(Some(Event::Disconnected)) => return SessionEnd::Disconnected,
                Ok(Some(Event::AdapterPowered(powered))) => {
                    info!("Adapter powered: {powered}");
                    self.powered = powered;
                }
                Ok(Some(Event::Discovered { .. })) => {}
            }
        }
    }

    /// Disconnect if needed, drop the session, cool down and rescan.
    async fn close_session(&mut self, end: SessionEnd) {
        self.transition(State::Disconnecting);
        let closed = match end {
            SessionEnd::Done => self.transport.disconnect().await,
            SessionEnd::Disconnected => self.transport.release().await,
        };
        if let Err(e) = closed {
            warn!("Failed to disconnect: {e}");
        }
        self.session = None;
        info!("Disconnected {}", self.config.target);

        self.transition(State::CoolingDown);
        sleep(self.config.timing.cooldown).await;

        // Whatever queued up meanwhile belongs to the closed session, except
        // for the adapter power state.
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::AdapterPowered(powered) => self.powered = powered,
                other => debug!("Dropping stale event {other:?}"),
            }
        }

        if self.powered {
            info!("Restarting scanning...");
            self.start_scanning().await;
        } else {
            self.transition(State::PoweredOff);
        }
    }

    fn on_notification(&mut self, session_id: SessionId, characteristic: u16, value: &[u8]) {
        let Some(session) = self.session.as_mut().filter(|s| s.id() == session_id) else {
            debug!("Ignoring {characteristic:04x} notification from closed session {session_id}");
            return;
        };

        match decoder::decode(characteristic, value, session, self.config.policy) {
            Ok(decoded) => {
                if self.config.debug {
                    info!("{characteristic:04x}: {} | {}", hex(value), decoded.summary);
                } else {
                    info!("{characteristic:04x}: | {}", decoded.summary);
                }
                if decoded.persist {
                    self.writer.enqueue_all(decoded.measurements);
                }
            }
            Err(e) => warn!("{characteristic:04x}: {} | {e}", hex(value)),
        }
    }
}
