//! Pool error types.

use std::time::Duration;

use dbkit_client::TransportError;
use thiserror::Error;

/// Errors returned by pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No session became available before the acquire deadline.
    #[error("timed out after {waited:?} waiting for a session")]
    Timeout {
        /// How long the request waited.
        waited: Duration,
    },

    /// The pool is at capacity and the wait queue is full.
    #[error("wait queue is full ({max} requests)")]
    QueueFull {
        /// Configured queue bound.
        max: usize,
    },

    /// Establishing a new session failed.
    #[error("failed to create session: {0}")]
    SessionCreateFailed(#[source] TransportError),

    /// `close` gave up waiting for busy sessions.
    #[error("{busy} sessions still busy when the drain timeout expired")]
    CloseTimeout {
        /// Sessions still checked out.
        busy: usize,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A session-level error.
    #[error(transparent)]
    Client(#[from] dbkit_client::Error),
}

impl PoolError {
    /// Whether the caller can reasonably try again.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::QueueFull { .. } | Self::SessionCreateFailed(_) => true,
            Self::Client(e) => e.is_retryable(),
            Self::CloseTimeout { .. } | Self::PoolClosed | Self::Config(_) => false,
        }
    }
}
