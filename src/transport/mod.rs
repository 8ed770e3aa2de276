//! BLE transport abstraction.
//!
//! The connection lifecycle drives the radio only through [`Transport`]; the
//! platform backend reports asynchronous happenings (adapter power, scan
//! results, indications, disconnects) as [`Event`]s on a channel that the
//! lifecycle consumes. Tests substitute a scripted transport.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::address::DeviceAddress;
use crate::session::SessionId;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Channel buffer size for transport events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Boxed future returned by [`Transport`] operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Error type for transport operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Operation needs a connected device
    #[error("Not connected")]
    NotConnected,
    #[error("Service {0:04x} not found")]
    ServiceNotFound(u16),
    #[error("Characteristic {0:04x} not found")]
    CharacteristicNotFound(u16),
}

/// Something the platform reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Adapter power state changed (or was first observed)
    AdapterPowered(bool),
    /// A device was seen while scanning
    Discovered {
        address: DeviceAddress,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// The connected device went away
    Disconnected,
    /// A subscribed characteristic indicated or notified a value
    Notification {
        session: SessionId,
        characteristic: u16,
        value: Vec<u8>,
    },
}

/// Capabilities of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties {
    pub indicate: bool,
    pub notify: bool,
    pub write: bool,
    pub write_without_response: bool,
}

impl Properties {
    pub fn subscribable(&self) -> bool {
        self.indicate || self.notify
    }

    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// Operations the lifecycle needs from a BLE stack.
///
/// All per-connection operations act on the device passed to the last
/// successful [`connect`](Transport::connect). Values of subscribed
/// characteristics are delivered as [`Event::Notification`] tagged with the
/// given session id.
pub trait Transport: Send + Sync {
    /// Start looking for advertising devices.
    ///
    /// Each device heard is reported as [`Event::Discovered`] until
    /// [`stop_scan`](Transport::stop_scan) is called.
    fn start_scan(&self) -> TransportFuture<'_, ()>;

    fn stop_scan(&self) -> TransportFuture<'_, ()>;

    /// Connect to `address`.
    ///
    /// A later disconnect by the device is reported as [`Event::Disconnected`].
    ///
    /// # Errors
    /// Returns [`TransportError::Bluetooth`] if the device cannot be reached.
    fn connect(&self, address: DeviceAddress) -> TransportFuture<'_, ()>;

    /// Disconnect the device and drop everything tied to the connection.
    fn disconnect(&self) -> TransportFuture<'_, ()>;

    /// Drop everything tied to a connection the device already closed,
    /// without sending a disconnect of our own.
    fn release(&self) -> TransportFuture<'_, ()>;

    /// Request an MTU; returns the MTU in effect.
    fn negotiate_mtu(&self, mtu: u16) -> TransportFuture<'_, u16>;

    /// Find the service with 16-bit id `service` on the connected device.
    ///
    /// # Errors
    /// Returns [`TransportError::ServiceNotFound`] if the device does not offer it.
    fn discover_service(&self, service: u16) -> TransportFuture<'_, ()>;

    /// Find a characteristic of the discovered service.
    fn discover_characteristic(&self, characteristic: u16) -> TransportFuture<'_, Properties>;

    /// Returns the number of descriptors found.
    fn discover_descriptors(&self, characteristic: u16) -> TransportFuture<'_, usize>;

    /// Ask for indications (or notifications) of `characteristic`.
    ///
    /// # Arguments
    /// * `characteristic` - 16-bit id of a discovered characteristic
    /// * `session` - Id copied into every [`Event::Notification`] of this subscription
    fn subscribe(&self, characteristic: u16, session: SessionId) -> TransportFuture<'_, ()>;

    /// Write `value`; `with_response` selects an acknowledged write request.
    fn write(&self, characteristic: u16, value: Vec<u8>, with_response: bool) -> TransportFuture<'_, ()>;
}
