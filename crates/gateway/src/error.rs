//! Gateway error types.

use crate::backend::BackendError;
use crate::protocol::ServerMessage;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or invalid client frame.
    #[error("Invalid message: {0}")]
    Protocol(String),

    /// Trading engine call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Trade store or payment processor failure.
    #[error("Service error: {0}")]
    Service(#[from] external_services::Error),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// ERROR frame sent to the client before a session is torn down.
    pub fn to_server_message(&self) -> ServerMessage {
        match self {
            GatewayError::Protocol(detail) => ServerMessage::error("Invalid message", detail.clone()),
            GatewayError::Backend(err) => ServerMessage::error(err.description(), err.to_string()),
            other => ServerMessage::error("Internal error", other.to_string()),
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
