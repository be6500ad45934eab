//! Crate-level error type.

use crate::broker::BrokerError;
use crate::handler::HandlerError;
use crate::message::MessageError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by the receive loop and the send path.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Event loop already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(String),
}
