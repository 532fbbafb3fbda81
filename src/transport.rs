//! Transport seam for BLE central operations.
//!
//! The session drives a [`Transport`] the same way regardless of backend:
//! each method requests an operation from the underlying BLE stack, and
//! asynchronous outcomes (advertisements, connects, discovery results, write
//! confirmations, disconnects) arrive as [`TransportEvent`]s on the channel
//! handed out when the transport was built. Implement this for your platform
//! BLE stack or a scripted test double.

use async_trait::async_trait;
use uuid::Uuid;

use crate::protocol::DeliveryMode;
use crate::Result;

/// State of the platform Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Resetting,
    Unauthorized,
    Unsupported,
    Unknown,
}

/// A peripheral observed during a scan.
///
/// `identifier` is the platform-stable ID (address on Linux, UUID on macOS);
/// `display_name` is the advertised local name, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub identifier: String,
    pub display_name: Option<String>,
}

/// A discovered characteristic and its write capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    /// Supports write-with-acknowledgment (ATT write request).
    pub write_with_ack: bool,
    /// Supports write-without-response (ATT write command).
    pub write_without_ack: bool,
}

impl CharacteristicInfo {
    pub fn writable(&self) -> bool {
        self.write_with_ack || self.write_without_ack
    }
}

/// Asynchronous notifications from the BLE stack.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertisement was observed while scanning.
    AdvertisementObserved(Device),
    /// A requested connection is established.
    Connected { identifier: String },
    /// A requested connection could not be established.
    ConnectFailed { identifier: String, reason: String },
    /// Service enumeration finished.
    ServicesDiscovered { services: Vec<Uuid> },
    /// Service enumeration failed.
    ServiceDiscoveryFailed { reason: String },
    /// Characteristic enumeration finished.
    CharacteristicsDiscovered { characteristics: Vec<CharacteristicInfo> },
    /// Outcome of an acknowledged write. Emitted only for
    /// [`DeliveryMode::WithAck`] chunks.
    WriteCompleted { outcome: std::result::Result<(), String> },
    /// The peripheral disconnected, either on request or spontaneously.
    Disconnected { reason: Option<String> },
}

/// BLE central capabilities consumed by the session.
///
/// Methods return `Ok(())` once the request has been accepted by the stack;
/// outcomes that arrive later are delivered as [`TransportEvent`]s. A
/// transport serves exactly one connection at a time.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Current radio state.
    async fn radio_state(&mut self) -> RadioState;

    /// Begin advertising discovery. Observed peripherals arrive as
    /// [`TransportEvent::AdvertisementObserved`].
    async fn start_scan(&mut self) -> Result<()>;

    /// Stop advertising discovery.
    async fn stop_scan(&mut self) -> Result<()>;

    /// Connect to a previously observed peripheral.
    async fn connect(&mut self, identifier: &str) -> Result<()>;

    /// Enumerate services on the connected peripheral.
    async fn discover_services(&mut self) -> Result<()>;

    /// Enumerate characteristics for the given services.
    async fn discover_characteristics(&mut self, services: &[Uuid]) -> Result<()>;

    /// Write one chunk to a characteristic. Returns once the stack has
    /// accepted the send; for [`DeliveryMode::WithAck`] the confirmation
    /// arrives later as [`TransportEvent::WriteCompleted`].
    async fn write(&mut self, characteristic: Uuid, bytes: &[u8], mode: DeliveryMode) -> Result<()>;

    /// Tear down the active connection.
    async fn disconnect(&mut self) -> Result<()>;
}
