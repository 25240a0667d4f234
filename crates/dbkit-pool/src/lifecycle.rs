//! Session lifecycle: states, metadata and the reset strategy run on
//! release.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbkit_client::{Connection, SessionId, WireSession};
use tokio::time::Instant;

/// Where a session currently is in its pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// In the idle set, available for acquire.
    Idle,
    /// Checked out by a caller.
    Busy,
    /// Being pinged or reset on its way back to the idle set.
    Validating,
    /// Closed or no longer tracked by the pool.
    Closed,
}

impl SessionState {
    /// Whether a caller may be using the session.
    #[must_use]
    pub fn is_checked_out(self) -> bool {
        matches!(self, Self::Busy | Self::Validating)
    }
}

/// Metadata about a checked-out session.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    /// Session identity.
    pub id: SessionId,
    /// When the session was established.
    pub created_at: Instant,
    /// How many times the session has been handed out, this one included.
    pub checkouts: u64,
    /// How long this acquire waited.
    pub waited: Duration,
}

impl SessionMetadata {
    /// Age of the session.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Strategy run on every released session before it is reused.
///
/// An error discards the session instead of returning it to the idle set.
/// Closures `Fn(&mut Connection<S>) -> dbkit_client::Result<()>` implement
/// this trait.
#[async_trait]
pub trait SessionReset<S: WireSession>: Send + Sync + 'static {
    /// Bring the session back to a clean state.
    async fn reset(&self, conn: &mut Connection<S>) -> dbkit_client::Result<()>;
}

#[async_trait]
impl<S, F> SessionReset<S> for F
where
    S: WireSession,
    F: Fn(&mut Connection<S>) -> dbkit_client::Result<()> + Send + Sync + 'static,
{
    async fn reset(&self, conn: &mut Connection<S>) -> dbkit_client::Result<()> {
        self(conn)
    }
}

/// Rolls back any open transaction and clears the session tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackReset;

#[async_trait]
impl<S: WireSession> SessionReset<S> for RollbackReset {
    async fn reset(&self, conn: &mut Connection<S>) -> dbkit_client::Result<()> {
        conn.rollback().await?;
        conn.set_tag(None);
        Ok(())
    }
}

/// Type-erased reset strategy.
pub type DynSessionReset<S> = Arc<dyn SessionReset<S>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_out_states() {
        assert!(SessionState::Busy.is_checked_out());
        assert!(SessionState::Validating.is_checked_out());
        assert!(!SessionState::Idle.is_checked_out());
        assert!(!SessionState::Closed.is_checked_out());
    }
}
