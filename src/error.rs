//! Error types for serial-bridge.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::FrameError;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error for broadcast messages.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to open or configure the serial device.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Telemetry validator could not be compiled.
    #[error("Invalid telemetry schema: {0}")]
    Schema(#[from] regex::Error),

    /// Frame-level protocol fault.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Stuffed payload does not fit in the 16-bit length field.
    #[error("Payload of {0} bytes exceeds the 65535 byte frame limit")]
    PayloadTooLarge(usize),

    /// Physical write to the device failed. Fatal for the session.
    #[error("Write to {port} failed: {source}")]
    WriteFailure {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// No release arrived from the device within the configured timeout.
    #[error("Flow gate release timed out after {0:?}")]
    GateTimeout(Duration),

    /// The session is closing or closed.
    #[error("Session closed")]
    SessionClosed,

    /// A port is already open (or being opened) on the hub.
    #[error("Port {0} is already open")]
    PortBusy(String),

    /// No open session exists for the port.
    #[error("Port {0} is not open")]
    PortNotOpen(String),

    /// A control line could not be understood.
    #[error("Invalid control command: {0}")]
    InvalidCommand(String),
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
