/// Error types for GATT sessions
///
/// `SessionError` is returned synchronously when a call's preconditions fail.
/// `TransferFailure` is the reason carried by a `TransferFailed` event once a transfer
/// has been accepted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::gatt::GattStatus;
use crate::config::ConfigError;
use crate::transport::abstraction::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Another transfer or connection attempt is in progress")]
    Busy,
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Transport rejected request: {0}")]
    TransportRejected(#[from] TransportError),
    #[error("No peer connected")]
    PeerUnavailable,
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::Configuration(err.to_string())
    }
}

/// Why an accepted transfer stopped before completing
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailure {
    #[error("link dropped mid-transfer")]
    ConnectionLost,
    #[error("fragment acknowledged with {0}")]
    WriteFailed(GattStatus),
    #[error("transport refused fragment: {0}")]
    TransportRejected(String),
}
