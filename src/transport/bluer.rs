//! BlueZ D-Bus transport.
//!
//! This backend uses the `bluer` crate to talk to the BlueZ daemon via
//! D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{EVENT_CHANNEL_BUFFER_SIZE, Event, Properties, Transport, TransportError, TransportFuture};
use crate::address::DeviceAddress;
use crate::session::SessionId;
use bluer::gatt::WriteOp;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service};
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session, Uuid,
};
use futures::stream::{SelectAll, Stream};
use futures::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::pin::{Pin, pin};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bluetooth base UUID; 16-bit ids occupy bits 96..112.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// How long to wait for BlueZ to resolve services after connecting.
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
const SERVICES_RESOLVE_ATTEMPTS: usize = 50;

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        TransportError::Bluetooth(err.to_string())
    }
}

/// Expand a 16-bit id to a full 128-bit UUID.
pub fn full_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))
}

/// Property changes of the devices seen during one discovery session.
type DeviceUpdates = Pin<Box<dyn Stream<Item = (Address, DeviceEvent)> + Send>>;

/// Signal strength carried by a device property change, if any.
fn rssi_update(event: DeviceEvent) -> Option<i16> {
    match event {
        DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi)) => Some(rssi),
        _ => None,
    }
}

/// State of the current connection.
struct Connection {
    device: Device,
    service: Option<Service>,
    characteristics: HashMap<u16, Characteristic>,
    // Disconnect watcher and notification forwarders
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// [`Transport`] implementation on top of BlueZ.
pub struct BluerTransport {
    // Keeps the D-Bus connection alive
    _session: Session,
    adapter: Adapter,
    events: mpsc::Sender<Event>,
    watcher: JoinHandle<()>,
    scan: Mutex<Option<JoinHandle<()>>>,
    connection: Mutex<Option<Connection>>,
}

impl BluerTransport {
    /// Open adapter `hci<index>` (or the default adapter for a negative index),
    /// power it on and start reporting its power state.
    ///
    /// # Arguments
    /// * `index` - Adapter number, negative for the system default adapter
    ///
    /// # Returns
    /// The transport and the receiver for its events.
    ///
    /// # Errors
    /// Returns [`TransportError::Bluetooth`] if BlueZ is unreachable or the
    /// adapter does not exist or cannot be powered.
    pub async fn open(index: i32) -> Result<(Self, mpsc::Receiver<Event>), TransportError> {
        let session = Session::new().await?;
        let adapter = if index < 0 {
            session.default_adapter().await?
        } else {
            session.adapter(&format!("hci{index}"))?
        };
        debug!("Using Bluetooth adapter {}", adapter.name());
        adapter.set_powered(true).await?;

        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {e}");
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
        let powered = adapter.is_powered().await?;
        let adapter_events = adapter.events().await?;
        let watcher = {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(Event::AdapterPowered(powered)).await.is_err() {
                    return;
                }
                let mut adapter_events = pin!(adapter_events);
                while let Some(event) = adapter_events.next().await {
                    let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event else {
                        continue;
                    };
                    if tx.send(Event::AdapterPowered(powered)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let transport = BluerTransport {
            _session: session,
            adapter,
            events: tx,
            watcher,
            scan: Mutex::new(None),
            connection: Mutex::new(None),
        };
        Ok((transport, rx))
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self) -> Result<Device, TransportError> {
        self.connection()
            .as_ref()
            .map(|c| c.device.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn service(&self) -> Result<Service, TransportError> {
        let connection = self.connection();
        let connection = connection.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .service
            .clone()
            .ok_or(TransportError::ServiceNotFound(0))
    }

    fn characteristic(&self, short: u16) -> Result<Characteristic, TransportError> {
        let connection = self.connection();
        let connection = connection.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .characteristics
            .get(&short)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(short))
    }

    fn track(&self, task: JoinHandle<()>) {
        match self.connection().as_mut() {
            Some(connection) => connection.tasks.push(task),
            None => task.abort(),
        }
    }

    async fn wait_for_services(device: &Device) -> Result<(), TransportError> {
        for _ in 0..SERVICES_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await? {
                return Ok(());
            }
            tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
        }
        warn!("Services of {} not resolved, trying anyway", device.address());
        Ok(())
    }
}

impl Drop for BluerTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Some(scan) = self.scan.lock().unwrap_or_else(PoisonError::into_inner).take() {
            scan.abort();
        }
    }
}

impl Transport for BluerTransport {
    fn start_scan(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let discovery = self.adapter.discover_devices().await?;
            let adapter = self.adapter.clone();
            let tx = self.events.clone();

            // Dropping the stream (by aborting the task) ends the discovery session
            let task = tokio::spawn(async move {
                let mut discovery = pin!(discovery);
                // Devices BlueZ already knows are replayed as added without
                // being in range; only an RSSI reading means an advertisement
                // was just received.
                let mut updates: SelectAll<DeviceUpdates> = SelectAll::new();
                loop {
                    let (address, rssi) = tokio::select! {
                        Some(event) = discovery.next() => {
                            let AdapterEvent::DeviceAdded(address) = event else {
                                continue;
                            };
                            let Ok(device) = adapter.device(address) else {
                                continue;
                            };
                            if let Ok(events) = device.events().await {
                                updates.push(Box::pin(events.map(move |event| (address, event))));
                            }
                            (address, device.rssi().await.ok().flatten())
                        }
                        Some((address, event)) = updates.next() => {
                            (address, rssi_update(event))
                        }
                        else => break,
                    };
                    let Some(rssi) = rssi else {
                        continue;
                    };
                    let name = match adapter.device(address) {
                        Ok(device) => device.name().await.ok().flatten(),
                        Err(_) => None,
                    };
                    let event = Event::Discovered {
                        address: address.into(),
                        name,
                        rssi: Some(rssi),
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });

            let previous = self
                .scan
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(task);
            if let Some(previous) = previous {
                previous.abort();
            }
            Ok(())
        })
    }

    fn stop_scan(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let task = self.scan.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(task) = task {
                task.abort();
            }
            Ok(())
        })
    }

    fn connect(&self, address: DeviceAddress) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let device = self.adapter.device(address.into())?;
            if !device.is_connected().await? {
                device.connect().await?;
            }

            let device_events = device.events().await?;
            let tx = self.events.clone();
            let watcher = tokio::spawn(async move {
                let mut device_events = pin!(device_events);
                while let Some(event) = device_events.next().await {
                    if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                        let _ = tx.send(Event::Disconnected).await;
                        break;
                    }
                }
            });

            *self.connection() = Some(Connection {
                device,
                service: None,
                characteristics: HashMap::new(),
                tasks: vec![watcher],
            });
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let connection = self.connection().take();
            match connection {
                Some(connection) => {
                    let device = connection.device.clone();
                    drop(connection);
                    device.disconnect().await?;
                    Ok(())
                }
                None => Err(TransportError::NotConnected),
            }
        })
    }

    fn release(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            // Aborts the disconnect watcher and notification forwarders
            drop(self.connection().take());
            Ok(())
        })
    }

    fn negotiate_mtu(&self, mtu: u16) -> TransportFuture<'_, u16> {
        Box::pin(async move {
            // BlueZ runs the ATT MTU exchange itself when connecting
            debug!("MTU {mtu} requested, exchange left to BlueZ");
            Ok(mtu)
        })
    }

    fn discover_service(&self, service: u16) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let device = self.device()?;
            Self::wait_for_services(&device).await?;

            let wanted = full_uuid(service);
            for candidate in device.services().await? {
                if candidate.uuid().await? == wanted {
                    if let Some(connection) = self.connection().as_mut() {
                        connection.service = Some(candidate);
                    }
                    return Ok(());
                }
            }
            Err(TransportError::ServiceNotFound(service))
        })
    }

    fn discover_characteristic(&self, characteristic: u16) -> TransportFuture<'_, Properties> {
        Box::pin(async move {
            let service = self.service()?;
            let wanted = full_uuid(characteristic);
            for candidate in service.characteristics().await? {
                if candidate.uuid().await? != wanted {
                    continue;
                }
                let flags = candidate.flags().await?;
                if let Some(connection) = self.connection().as_mut() {
                    connection.characteristics.insert(characteristic, candidate);
                }
                return Ok(Properties {
                    indicate: flags.indicate,
                    notify: flags.notify,
                    write: flags.write,
                    write_without_response: flags.write_without_response,
                });
            }
            Err(TransportError::CharacteristicNotFound(characteristic))
        })
    }

    fn discover_descriptors(&self, characteristic: u16) -> TransportFuture<'_, usize> {
        Box::pin(async move {
            let characteristic = self.characteristic(characteristic)?;
            Ok(characteristic.descriptors().await?.len())
        })
    }

    fn subscribe(&self, characteristic: u16, session: SessionId) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let values = self.characteristic(characteristic)?.notify().await?;
            let tx = self.events.clone();
            let task = tokio::spawn(async move {
                let mut values = pin!(values);
                while let Some(value) = values.next().await {
                    let event = Event::Notification {
                        session,
                        characteristic,
                        value,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            self.track(task);
            Ok(())
        })
    }

    fn write(&self, characteristic: u16, value: Vec<u8>, with_response: bool) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let request = CharacteristicWriteRequest {
                op_type: if with_response {
                    WriteOp::Request
                } else {
                    WriteOp::Command
                },
                ..Default::default()
            };
            self.characteristic(characteristic)?
                .write_ext(&value, &request)
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_uuid() {
        assert_eq!(
            full_uuid(0x78b2).to_string(),
            "000078b2-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            full_uuid(0x8a21).to_string(),
            "00008a21-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_rssi_update() {
        assert_eq!(
            rssi_update(DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-67))),
            Some(-67)
        );
        assert_eq!(
            rssi_update(DeviceEvent::PropertyChanged(DeviceProperty::Connected(true))),
            None
        );
    }

    #[test]
    fn test_address_conversion() {
        let addr = bluer::Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let device: DeviceAddress = addr.into();
        assert_eq!(device.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(bluer::Address::from(device), addr);
    }
}
