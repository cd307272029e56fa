//! Error types for the gateway.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error on a socket or the serial device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A `SEND` token was not exactly two hexadecimal digits.
    #[error("Invalid hex byte: {0:?}")]
    InvalidHex(String),

    /// A `SEND` command carried no bytes.
    #[error("Empty packet")]
    EmptyPacket,

    /// The bus did not echo a transmitted packet before the deadline.
    #[error("No echo received within {0:?}")]
    NoEcho(Duration),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - client write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
