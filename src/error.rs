//! Error handling types for subline
//!
//! Every failure a caller can observe is a [`ClientError`]. Orphan responses
//! and malformed frames are diagnostics only: they are logged by the reader
//! and never reach a caller.

use std::sync::PoisonError;
use thiserror::Error;

/// Errors surfaced by the client
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The initial connection to the controller could not be established
    #[error("failed to connect to {address}: {message}")]
    Connection { address: String, message: String },

    /// An established connection failed while the request was in flight
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// The request's deadline elapsed before a response arrived
    #[error("request timed out")]
    Timeout,

    /// The request was abandoned locally (cancelled or client closed)
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// A frame or request could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The controller rejected a subscribe or release request
    #[error("subscription to {topic} rejected: {reason}")]
    Subscription { topic: String, reason: String },

    /// Connection was lost and a reconnect is in progress; retry later
    #[error("reconnecting to controller")]
    Reconnecting,

    /// Connection is down for good (closed, or the reconnect attempt failed)
    #[error("not connected")]
    Disconnected,

    /// The outbound queue is full
    #[error("outbound queue full ({capacity} requests)")]
    QueueFull { capacity: usize },

    /// The same message id is already awaiting a response
    #[error("duplicate message id: {0}")]
    DuplicateMessageId(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn connection(address: impl Into<String>, source: &std::io::Error) -> Self {
        ClientError::Connection {
            address: address.into(),
            message: source.to_string(),
        }
    }

    pub fn transport_lost(message: impl Into<String>) -> Self {
        ClientError::TransportLost(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        ClientError::Cancelled(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol(message.into())
    }

    pub fn subscription(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        ClientError::Subscription {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ClientError::Config(message.into())
    }
}

/// Helper trait to recover poisoned `std::sync` locks
pub(crate) trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock, logging which operation hit it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for std::result::Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "subline::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
