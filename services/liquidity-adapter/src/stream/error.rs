//! Error types for the stream client

use super::messages::ErrorCode;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`StreamClient`](super::StreamClient) operations
#[derive(Debug, Error)]
pub enum StreamError {
    /// Could not open the connection, or it is no longer open
    #[error("Connection error: {0}")]
    Connection(String),

    /// The provider answered the request with `success: false`
    #[error("Request for {instrument} rejected by provider ({code}): {message}")]
    SubscriptionRejected {
        instrument: String,
        code: ErrorCode,
        message: String,
    },

    /// No tagged response arrived in time
    #[error("No response for {instrument} within {timeout:?}")]
    SubscriptionTimeout {
        instrument: String,
        timeout: Duration,
    },

    /// A handler binding or a pending subscription already exists
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    /// Unsubscribe without an active handler binding
    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    /// An unsubscribe request for the instrument is still pending
    #[error("Unsubscription from {0} is already in flight")]
    UnsubscriptionInFlight(String),

    /// The client was disposed while the request was pending
    #[error("Request cancelled")]
    Cancelled,

    /// Inbound frame could not be parsed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Sending on the connection failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Rejected locally before anything was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StreamError {
    /// Local duplicate or provider code 3007
    #[must_use]
    pub fn is_already_subscribed(&self) -> bool {
        match self {
            Self::AlreadySubscribed(_) => true,
            Self::SubscriptionRejected { code, .. } => *code == ErrorCode::ALREADY_SUBSCRIBED,
            _ => false,
        }
    }

    /// The connection is unusable and the client has to be rebuilt
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Transport(_))
    }

    /// Provider error code, if the provider rejected the request
    #[must_use]
    pub const fn provider_code(&self) -> Option<ErrorCode> {
        match self {
            Self::SubscriptionRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
