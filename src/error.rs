//! # Error Types
//!
//! Custom error types for Payload DAQ using `thiserror`.

use thiserror::Error;

/// Main error type for Payload DAQ
#[derive(Debug, Error)]
pub enum DaqError {
    /// Serial link errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// None of the candidate serial devices could be opened
    #[error("No serial device found (tried: {0})")]
    SerialPortNotFound(String),

    /// Neither storage target is usable and no consumer channel is connected
    #[error("No valid locations exist to write data: {0}")]
    NoValidTarget(String),

    /// Local IPC channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Record serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Payload DAQ
pub type Result<T> = std::result::Result<T, DaqError>;
