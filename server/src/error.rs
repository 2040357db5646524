//! Error taxonomy for the session server
//!
//! Every variant is scoped to a single connection. Only a failure to bind the
//! listener ever reaches `main`.

use crate::connection_manager::ConnectionState;
use shared::{PlayerId, ProtocolError};
use thiserror::Error;

/// Failures while serving one connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Undecodable or out-of-range client input. Dropped without mutation.
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] ProtocolError),

    /// Update older than the last one applied for this player. Dropped.
    #[error("stale update for {id}: timestamp {timestamp} < {last}")]
    StaleUpdate {
        id: PlayerId,
        timestamp: u64,
        last: u64,
    },

    /// Identity no longer maps to a live player, usually a disconnect race.
    #[error("unknown player {0}")]
    UnknownIdentifier(PlayerId),

    /// WebSocket protocol or socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection refused at capacity.
    #[error("server full ({0} clients)")]
    ServerFull(usize),

    /// Lifecycle step out of order.
    #[error("invalid connection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl SessionError {
    /// Errors that are expected during normal play and only logged at debug.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            SessionError::MalformedEvent(_)
                | SessionError::StaleUpdate { .. }
                | SessionError::UnknownIdentifier(_)
        )
    }
}
