//! receiptprinter: print text and raw ESC/POS bytes to BLE thermal receipt printers.
//!
//! Main modules:
//! - transport: BLE capability seam (trait + event enum)
//! - btle: btleplug-backed transport
//! - registry: deduplicated scan results
//! - protocol: print-job frames, font-size commands, chunking
//! - session: connection state machine and caller-facing handle

pub mod btle;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

/// Session API: scan/connect/print against any transport
pub use session::{PrinterHandle, SessionConfig};
/// Protocol utilities (frames, chunking, font commands)
pub use protocol::*;
pub use transport::{CharacteristicInfo, Device, RadioState, Transport, TransportEvent};

/// Errors that can terminate a printer request.
#[derive(Debug, thiserror::Error)]
pub enum PrinterError {
    #[error("bluetooth radio unavailable (state: {0:?})")]
    BluetoothUnavailable(transport::RadioState),

    #[error("no known device with identifier {0}")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("no services discovered on the peripheral")]
    NoServices,

    #[error("no write-capable characteristic found")]
    CharacteristicNotFound,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("connection was torn down before the request completed")]
    Disconnected,

    #[error("another request is already in flight")]
    Busy,

    #[error("printer session is no longer running")]
    SessionClosed,
}

/// Result type alias for printer operations.
pub type Result<T> = std::result::Result<T, PrinterError>;
