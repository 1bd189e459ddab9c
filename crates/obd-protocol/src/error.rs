//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
///
/// "No data" replies and a silent ECU are not errors: they come back as
/// ordinary responses and are handled by retry and strike accounting.
#[derive(Debug, Error)]
pub enum ObdError {
    /// Transport connect/write/read failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Invalid response from adapter
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Protocol not supported
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// Adapter never answered the initial handshake
    #[error("Adapter handshake failed: {0}")]
    HandshakeFailed(String),

    /// Operation attempted before the transport was connected
    #[error("OBD adapter not connected")]
    NotConnected,

    /// Cooperative cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}
