//! Client error types.

use thiserror::Error;

use crate::transport::{SessionId, TransportError};

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by session-level operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The cached prepared statement for `sql` was rejected by the server
    /// and has been removed from the cache. Retrying once re-prepares it.
    #[error("prepared statement is stale and was invalidated: {sql}")]
    StaleStatement {
        /// SQL text of the invalidated statement.
        sql: String,
        /// Error reported by the server.
        #[source]
        source: TransportError,
    },

    /// `next()` was called on a cursor after `close()`.
    #[error("cursor is closed")]
    CursorClosed,

    /// A wire call failed.
    #[error("session {session} failed during {operation}: {source}")]
    Transport {
        /// Session that failed.
        session: SessionId,
        /// Operation in progress.
        operation: &'static str,
        /// Underlying error.
        #[source]
        source: TransportError,
    },

    /// The session hit a fatal transport error earlier and cannot be used.
    #[error("session {0} is no longer usable")]
    SessionBroken(SessionId),

    /// The number of bind values does not match the statement.
    #[error("statement expects {expected} bind values, got {actual}")]
    BindMismatch {
        /// Placeholders in the statement.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },

    /// Invalid option value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call is expected to succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleStatement { .. })
    }

    /// Session the error relates to, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Transport { session, .. } | Self::SessionBroken(session) => Some(*session),
            _ => None,
        }
    }
}
