//! btleplug-backed transport.
//!
//! Bridges the platform BLE stack onto the [`Transport`] seam: central
//! events are pumped into the session's event channel by a background task,
//! and request methods translate directly to btleplug calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::DeliveryMode;
use crate::transport::{CharacteristicInfo, Device, RadioState, Transport, TransportEvent};
use crate::{PrinterError, Result};

/// Service UUIDs most BLE thermal printers expose: classic SPP, then the
/// ISSC transparent UART.
pub const PREFERRED_SERVICE_UUIDS: [Uuid; 2] = [
    Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb),
    Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455),
];

/// Write characteristics matching [`PREFERRED_SERVICE_UUIDS`]. Preferred
/// over other write-capable characteristics when present.
pub const PREFERRED_WRITE_UUIDS: [Uuid; 2] = [
    Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb),
    Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3),
];

/// [`Transport`] implementation over the first available btleplug adapter.
pub struct BtleTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<Uuid, Characteristic>,
    /// Shared with the event pump so spontaneous disconnects of the active
    /// peripheral are reported exactly once.
    connected_id: Arc<Mutex<Option<PeripheralId>>>,
}

impl BtleTransport {
    /// Initialize the platform BLE stack and start the event pump.
    ///
    /// Returns the transport plus the event channel to hand to
    /// [`crate::session::PrinterHandle::spawn`].
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapters = manager.adapters().await.map_err(ble_err)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(PrinterError::BluetoothUnavailable(RadioState::Unsupported))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected_id = Arc::new(Mutex::new(None));
        tokio::spawn(pump_central_events(
            adapter.clone(),
            events_tx.clone(),
            connected_id.clone(),
        ));

        Ok((
            Self {
                adapter,
                events: events_tx,
                peripheral: None,
                characteristics: HashMap::new(),
                connected_id,
            },
            events_rx,
        ))
    }
}

#[async_trait::async_trait]
impl Transport for BtleTransport {
    async fn radio_state(&mut self) -> RadioState {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => RadioState::PoweredOn,
            Ok(CentralState::PoweredOff) => RadioState::PoweredOff,
            Ok(_) => RadioState::Unknown,
            Err(err) => {
                tracing::debug!(error = %err, "adapter state query failed");
                RadioState::Unknown
            }
        }
    }

    async fn start_scan(&mut self) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "scan could not start");
                PrinterError::BluetoothUnavailable(RadioState::Unknown)
            })
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(ble_err)
    }

    async fn connect(&mut self, identifier: &str) -> Result<()> {
        let peripherals = self.adapter.peripherals().await.map_err(ble_err)?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == identifier)
            .ok_or_else(|| PrinterError::DeviceNotFound(identifier.to_string()))?;

        match peripheral.connect().await {
            Ok(()) => {
                *self.connected_id.lock().unwrap() = Some(peripheral.id());
                self.peripheral = Some(peripheral);
                let _ = self.events.send(TransportEvent::Connected {
                    identifier: identifier.to_string(),
                });
            }
            Err(err) => {
                let _ = self.events.send(TransportEvent::ConnectFailed {
                    identifier: identifier.to_string(),
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<()> {
        let peripheral = self.peripheral.as_ref().ok_or(PrinterError::Disconnected)?;
        peripheral
            .discover_services()
            .await
            .map_err(|err| PrinterError::ConnectionFailed(err.to_string()))?;

        let mut services: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        services.sort_by_key(|uuid| !PREFERRED_SERVICE_UUIDS.contains(uuid));
        let _ = self
            .events
            .send(TransportEvent::ServicesDiscovered { services });
        Ok(())
    }

    async fn discover_characteristics(&mut self, services: &[Uuid]) -> Result<()> {
        let peripheral = self.peripheral.as_ref().ok_or(PrinterError::Disconnected)?;

        self.characteristics.clear();
        let mut infos = Vec::new();
        for characteristic in peripheral.characteristics() {
            if !services.contains(&characteristic.service_uuid) {
                continue;
            }
            infos.push(CharacteristicInfo {
                uuid: characteristic.uuid,
                write_with_ack: characteristic.properties.contains(CharPropFlags::WRITE),
                write_without_ack: characteristic
                    .properties
                    .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            });
            self.characteristics
                .insert(characteristic.uuid, characteristic);
        }
        // known printer characteristics first, so "first match wins" lands
        // on them when present
        infos.sort_by_key(|info| !PREFERRED_WRITE_UUIDS.contains(&info.uuid));

        let _ = self.events.send(TransportEvent::CharacteristicsDiscovered {
            characteristics: infos,
        });
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, bytes: &[u8], mode: DeliveryMode) -> Result<()> {
        let peripheral = self.peripheral.as_ref().ok_or(PrinterError::Disconnected)?;
        let characteristic = self
            .characteristics
            .get(&characteristic)
            .ok_or(PrinterError::CharacteristicNotFound)?;
        let write_type = match mode {
            DeliveryMode::WithAck => WriteType::WithResponse,
            DeliveryMode::FireAndForget => WriteType::WithoutResponse,
        };
        peripheral
            .write(characteristic, bytes, write_type)
            .await
            .map_err(|err| PrinterError::WriteFailed(err.to_string()))?;
        // btleplug's with-response write resolves on the peripheral's ack
        if mode == DeliveryMode::WithAck {
            let _ = self
                .events
                .send(TransportEvent::WriteCompleted { outcome: Ok(()) });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.characteristics.clear();
        self.connected_id.lock().unwrap().take();
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await.map_err(ble_err)?;
            let _ = self
                .events
                .send(TransportEvent::Disconnected { reason: None });
        }
        Ok(())
    }
}

fn ble_err(err: btleplug::Error) -> PrinterError {
    PrinterError::ConnectionFailed(err.to_string())
}

/// Forward btleplug central events onto the transport event channel until
/// the session goes away.
async fn pump_central_events(
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected_id: Arc<Mutex<Option<PeripheralId>>>,
) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "could not subscribe to central events");
            return;
        }
    };

    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    let display_name = peripheral
                        .properties()
                        .await
                        .ok()
                        .flatten()
                        .and_then(|props| props.local_name);
                    let _ = events.send(TransportEvent::AdvertisementObserved(Device {
                        identifier: id.to_string(),
                        display_name,
                    }));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                // only the active peripheral's loss is the session's business
                let was_active = connected_id.lock().unwrap().take_if(|c| *c == id).is_some();
                if was_active {
                    let _ = events.send(TransportEvent::Disconnected {
                        reason: Some("peripheral disconnected".into()),
                    });
                }
            }
            _ => {}
        }
        if events.is_closed() {
            break;
        }
    }
}
