//! A logical session: one wire session plus its statement cache.

use tokio::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fetch::{Cursor, FetchWindow};
use crate::instrumentation::{SanitizationConfig, extract_operation};
use crate::options::ExecuteOptions;
use crate::statement_cache::{StatementCache, StatementHandle};
use crate::transport::{
    CursorId, Execution, RowBatch, SessionId, TransportError, WireSession,
};
use crate::value::SqlValue;

/// One established session to the database.
///
/// Wraps the wire session with a per-session statement cache. Statement
/// handles and server cursors that go out of use are closed lazily, before
/// the next round-trip.
pub struct Connection<S: WireSession> {
    id: SessionId,
    session: S,
    cache: StatementCache,
    deferred_cursors: Vec<CursorId>,
    broken: bool,
    tag: Option<String>,
    created_at: Instant,
    last_used: Instant,
    sanitizer: SanitizationConfig,
}

impl<S: WireSession> Connection<S> {
    /// Wrap an established wire session.
    pub fn new(id: SessionId, session: S, cache: StatementCache) -> Self {
        let now = Instant::now();
        Self {
            id,
            session,
            cache,
            deferred_cursors: Vec::new(),
            broken: false,
            tag: None,
            created_at: now,
            last_used: now,
            sanitizer: SanitizationConfig::default(),
        }
    }

    /// Session identity.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session state fingerprint used to match reuse requests.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Record the session state fingerprint.
    pub fn set_tag(&mut self, tag: Option<String>) {
        self.tag = tag;
    }

    /// When the session was established.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the session last completed a round-trip.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since the last round-trip.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Whether a fatal transport error made the session unusable.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The session's statement cache.
    #[must_use]
    pub fn statement_cache(&self) -> &StatementCache {
        &self.cache
    }

    /// Mutable access to the statement cache, e.g. to resize it.
    pub fn statement_cache_mut(&mut self) -> &mut StatementCache {
        &mut self.cache
    }

    /// The wire session.
    #[must_use]
    pub fn wire(&self) -> &S {
        &self.session
    }

    /// Replace the SQL sanitization used in log output.
    pub fn set_sanitization(&mut self, config: SanitizationConfig) {
        self.sanitizer = config;
    }

    /// Prepare `sql`, consulting the statement cache first.
    ///
    /// The returned handle counts as an in-flight reference and must be
    /// given back with [`Connection::release_statement`].
    pub async fn prepare(&mut self, sql: &str, keep_in_cache: bool) -> Result<StatementHandle> {
        self.ensure_usable()?;
        self.flush_deferred().await?;

        if let Some(handle) = self.cache.lookup(sql, keep_in_cache) {
            return Ok(handle);
        }

        let statement = match self.session.prepare(sql).await {
            Ok(statement) => statement,
            Err(source) => return Err(self.transport_error("prepare", source)),
        };
        self.touch();
        tracing::trace!(session = %self.id, statement = %statement.id, "prepared statement");
        Ok(self.cache.insert(statement, keep_in_cache))
    }

    /// Give back a statement handle.
    pub fn release_statement(&mut self, handle: StatementHandle) {
        self.cache.release(handle);
    }

    /// Execute a query and open a cursor over its rows.
    ///
    /// Rows delivered with the execute acknowledgment (up to
    /// `options.prefetch_size`) are buffered immediately; the rest are
    /// fetched `options.array_size` at a time.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<Cursor<'_, S>> {
        let (handle, execution, prefetch_rows) = self.run(sql, params, options).await?;
        let mut window = FetchWindow::open(
            options.array_size,
            prefetch_rows,
            handle.statement().columns.clone(),
        );
        window.attach(execution.cursor, execution.prefetched);
        Ok(Cursor::new(self, window, handle))
    }

    /// Execute a statement that returns no rows. Returns the rows affected.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<u64> {
        let (handle, execution, _) = self.run(sql, params, options).await?;
        self.cache.release(handle);
        if let Some(cursor) = execution.cursor {
            self.close_cursor(cursor).await?;
        }
        Ok(execution.rows_affected)
    }

    /// Commit the current transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;
        match self.session.commit().await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(source) => Err(self.transport_error("commit", source)),
        }
    }

    /// Roll back the current transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_usable()?;
        match self.session.rollback().await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(source) => Err(self.transport_error("rollback", source)),
        }
    }

    /// Lightweight liveness round-trip.
    pub async fn ping(&mut self) -> Result<()> {
        self.ensure_usable()?;
        match self.session.ping().await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(source) => Err(self.transport_error("ping", source)),
        }
    }

    /// Close the session.
    pub async fn close(mut self) -> Result<()> {
        tracing::debug!(session = %self.id, "closing session");
        self.session
            .close()
            .await
            .map_err(|source| Error::Transport {
                session: self.id,
                operation: "close",
                source,
            })
    }

    async fn run(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &ExecuteOptions,
    ) -> Result<(StatementHandle, Execution, u32)> {
        options.validate()?;
        let handle = self.prepare(sql, options.keep_in_cache).await?;

        let expected = handle.statement().bind_count;
        if expected != params.len() {
            self.cache.release(handle);
            return Err(Error::BindMismatch {
                expected,
                actual: params.len(),
            });
        }

        let request = options.request_for(handle.statement());
        tracing::debug!(
            session = %self.id,
            operation = extract_operation(sql),
            sql = %self.sanitizer.sanitize(sql),
            cached = handle.is_cached(),
            prefetch = request.prefetch_rows,
            "executing statement"
        );

        match self.session.execute(handle.statement(), params, request).await {
            Ok(execution) => {
                self.touch();
                Ok((handle, execution, request.prefetch_rows))
            }
            Err(source) if source.is_stale_statement() => {
                tracing::debug!(
                    session = %self.id,
                    statement = %handle.id(),
                    "server rejected cached statement, invalidating"
                );
                self.cache.invalidate(&handle);
                self.cache.release(handle);
                Err(Error::StaleStatement {
                    sql: sql.to_string(),
                    source,
                })
            }
            Err(source) => {
                self.cache.release(handle);
                Err(self.transport_error("execute", source))
            }
        }
    }

    pub(crate) async fn fetch_batch(&mut self, cursor: CursorId, max_rows: u32) -> Result<RowBatch> {
        self.ensure_usable()?;
        match self.session.fetch(cursor, max_rows).await {
            Ok(batch) => {
                self.touch();
                tracing::trace!(
                    session = %self.id,
                    cursor = %cursor,
                    rows = batch.rows.len(),
                    exhausted = batch.exhausted,
                    "fetched batch"
                );
                Ok(batch)
            }
            Err(source) => Err(self.transport_error("fetch", source)),
        }
    }

    pub(crate) async fn close_cursor(&mut self, cursor: CursorId) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        match self.session.close_cursor(cursor).await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(source) => Err(self.transport_error("close cursor", source)),
        }
    }

    pub(crate) fn defer_cursor_close(&mut self, cursor: CursorId) {
        self.deferred_cursors.push(cursor);
    }

    /// Close cursors dropped without `close()` and statements that left the
    /// cache.
    ///
    /// Only fatal errors are returned; other cleanup failures are logged so
    /// they do not fail the caller's unrelated round-trip.
    async fn flush_deferred(&mut self) -> Result<()> {
        let mut pending = std::mem::take(&mut self.deferred_cursors).into_iter();
        while let Some(cursor) = pending.next() {
            match self.session.close_cursor(cursor).await {
                Ok(()) => self.touch(),
                Err(source) if source.is_fatal() => {
                    self.deferred_cursors.extend(pending);
                    return Err(self.transport_error("close cursor", source));
                }
                Err(source) => tracing::warn!(
                    session = %self.id,
                    cursor = %cursor,
                    error = %source,
                    "failed to close cursor"
                ),
            }
        }
        for statement in self.cache.take_orphans() {
            if let Err(source) = self.session.close_statement(statement).await {
                if source.is_fatal() {
                    return Err(self.transport_error("close statement", source));
                }
                tracing::warn!(
                    session = %self.id,
                    statement = %statement,
                    error = %source,
                    "failed to close statement"
                );
            }
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken {
            Err(Error::SessionBroken(self.id))
        } else {
            Ok(())
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn transport_error(&mut self, operation: &'static str, source: TransportError) -> Error {
        if source.is_fatal() {
            tracing::warn!(
                session = %self.id,
                operation,
                error = %source,
                "session failed, marking unusable"
            );
            self.broken = true;
        }
        Error::Transport {
            session: self.id,
            operation,
            source,
        }
    }
}

impl<S: WireSession> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("broken", &self.broken)
            .field("cached_statements", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::transport::{ExecuteRequest, PreparedStatement, StatementId, StatementKind};

    /// Session that records cursor closes and fails them with `close_error`.
    #[derive(Default)]
    struct CloseRecorder {
        attempted: Vec<CursorId>,
        close_error: Option<fn() -> TransportError>,
    }

    #[async_trait]
    impl WireSession for CloseRecorder {
        async fn prepare(&mut self, sql: &str) -> std::result::Result<PreparedStatement, TransportError> {
            Ok(PreparedStatement {
                id: StatementId(1),
                sql: Arc::from(sql),
                bind_count: 0,
                columns: Vec::<crate::row::Column>::new().into(),
                kind: StatementKind::Dml,
            })
        }

        async fn execute(
            &mut self,
            _statement: &PreparedStatement,
            _params: &[SqlValue],
            _request: ExecuteRequest,
        ) -> std::result::Result<Execution, TransportError> {
            Ok(Execution {
                cursor: None,
                prefetched: RowBatch::default(),
                rows_affected: 1,
            })
        }

        async fn fetch(&mut self, _cursor: CursorId, _max_rows: u32) -> std::result::Result<RowBatch, TransportError> {
            Ok(RowBatch::default())
        }

        async fn close_cursor(&mut self, cursor: CursorId) -> std::result::Result<(), TransportError> {
            self.attempted.push(cursor);
            match self.close_error {
                Some(error) => Err(error()),
                None => Ok(()),
            }
        }

        async fn close_statement(&mut self, _statement: StatementId) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn commit(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn rollback(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn ping(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn connection(close_error: Option<fn() -> TransportError>) -> Connection<CloseRecorder> {
        let session = CloseRecorder {
            close_error,
            ..CloseRecorder::default()
        };
        Connection::new(SessionId(3), session, StatementCache::new(4))
    }

    #[tokio::test]
    async fn test_non_fatal_cursor_close_errors_are_logged_not_returned() {
        let mut conn = connection(Some(|| TransportError::Server {
            code: 1001,
            message: "invalid cursor".into(),
        }));
        conn.defer_cursor_close(CursorId(7));
        conn.defer_cursor_close(CursorId(8));

        let handle = conn.prepare("UPDATE t SET x = 1", true).await.unwrap();
        conn.release_statement(handle);

        assert_eq!(conn.wire().attempted, vec![CursorId(7), CursorId(8)]);
        assert!(conn.deferred_cursors.is_empty());
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_fatal_cursor_close_keeps_unattempted_cursors() {
        let mut conn = connection(Some(|| TransportError::ConnectionClosed));
        conn.defer_cursor_close(CursorId(7));
        conn.defer_cursor_close(CursorId(8));

        let err = conn.prepare("UPDATE t SET x = 1", true).await.unwrap_err();
        assert!(matches!(err, Error::Transport { operation: "close cursor", .. }));
        assert!(conn.is_broken());
        assert_eq!(conn.wire().attempted, vec![CursorId(7)]);
        assert_eq!(conn.deferred_cursors, vec![CursorId(8)]);
    }

    #[tokio::test]
    async fn test_deferred_cursors_close_before_execute() {
        let mut conn = connection(None);
        conn.defer_cursor_close(CursorId(5));

        let affected = conn
            .execute("UPDATE t SET x = 1", &[], &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(conn.wire().attempted, vec![CursorId(5)]);
    }
}
