//! Connection error types

use obd_protocol::ObdError;
use recording::RecordingError;
use storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the connection manager
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("OBD error: {0}")]
    Obd(#[from] ObdError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    /// The connected vehicle is not the one the profile describes
    #[error("Vehicle does not match profile {profile}: expected {expected}, found {found}")]
    ProfileMismatch {
        profile: String,
        expected: String,
        found: String,
    },

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("No adapter session")]
    NotConnected,

    #[error("Vehicle is not live")]
    NotLive,

    #[error("Adapter discovery failed: {0}")]
    Discovery(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConnectionError {
    /// Whether the error is the result of a cancelled connect
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectionError::Obd(ObdError::Cancelled))
    }
}

impl From<config::ConfigError> for ConnectionError {
    fn from(err: config::ConfigError) -> Self {
        ConnectionError::Config(err.to_string())
    }
}
