//! Error types for the S2S trust layer.

use crate::session::ConnectionId;
use parley_types::{DomainError, DomainPairId};

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed or was never registered.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// An outbound connection could not be requested.
    #[error("failed to connect {pair}: {reason}")]
    ConnectFailed {
        /// The pair the connection was requested for.
        pair: DomainPairId,
        /// Transport-specific failure description.
        reason: String,
    },
}

/// Errors that can occur while negotiating or using S2S trust.
#[derive(Debug, thiserror::Error)]
pub enum DialbackError {
    /// The domain pair is malformed or not served here.
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    /// Writing to, or opening, a connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Dialback was started without the remote stream id.
    #[error("remote stream id missing")]
    MissingStreamId,

    /// The connection is not known to the manager.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Application traffic was offered for a pair that is not trusted.
    #[error("domain pair {0} is not authenticated")]
    NotAuthenticated(DomainPairId),
}

impl DialbackError {
    /// Stream error condition sent to the peer when this error terminates
    /// a connection.
    pub fn stream_condition(&self) -> &'static str {
        match self {
            Self::Domain(DomainError::NotLocalDomain(_)) => "host-unknown",
            Self::Domain(_) => "invalid-from",
            Self::MissingStreamId => "bad-request",
            Self::Transport(_) | Self::UnknownConnection(_) => "internal-server-error",
            Self::NotAuthenticated(_) => "not-authorized",
        }
    }
}
