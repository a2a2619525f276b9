//! Error handling for the bridge
//!
//! Only configuration and cloud-side failures ever leave the service; Modbus
//! failures are absorbed by the fetch orchestrator and turned into retries or
//! degraded records.

use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// Missing or invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Modbus host unreachable or refused the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Device reachable but the register read failed
    #[error("Read error: {0}")]
    Read(String),

    /// Operation exceeded its deadline
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Malformed frame or unexpected message from a peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cloud channel failure (publish, twin request, non-success status)
    #[error("Cloud error: {0}")]
    Cloud(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// Internal errors (task join failures, closed channels)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for BridgeError {
    fn from(err: figment::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::Cloud(format!("MQTT client error: {}", err))
    }
}
