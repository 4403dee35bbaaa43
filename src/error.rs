//! Error definitions shared by the MQTT session and the telemetry dispatcher

use thiserror::Error;

/// Failure kinds surfaced by the bridge core
///
/// Connection and send failures are normally absorbed by the resilient publish
/// loop. They only reach a caller through a direct `connect()` call or as the
/// diagnostic attached to an error event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The MQTT session could not be established or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// A publish failed on an otherwise established session
    #[error("send error: {0}")]
    Send(String),

    /// Malformed input (reading value, broker address, configuration value)
    #[error("validation error: {0}")]
    Validation(String),

    /// The serial port, the session or its worker is closed
    #[error("not open: {0}")]
    NotOpen(String),

    /// The caller cancelled the operation before it completed
    #[error("operation cancelled")]
    Cancelled,
}
