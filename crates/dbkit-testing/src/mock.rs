//! In-memory wire session.
//!
//! [`MockDatabase`] holds scripted statements and shared counters;
//! [`MockConnector`] opens [`MockSession`]s against it. Sessions behave like
//! a server that materializes results: each execute opens a cursor over the
//! scripted rows and delivers up to the requested prefetch with the
//! acknowledgment. A batch shorter than requested means the cursor is
//! exhausted and has been released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dbkit_client::{
    Column, ColumnType, Connector, CursorId, ExecuteRequest, Execution, PreparedStatement,
    RowBatch, SqlValue, StatementId, StatementKind, TransportError, WireSession,
};
use hashbrown::HashMap;
use parking_lot::Mutex;

/// A scripted statement.
#[derive(Debug, Clone)]
pub struct Script {
    /// Statement kind reported by prepare.
    pub kind: StatementKind,
    /// Placeholders reported by prepare.
    pub bind_count: usize,
    /// Result columns.
    pub columns: Vec<Column>,
    /// Result rows.
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows affected, for DML.
    pub rows_affected: u64,
}

/// Snapshot of the wire calls a [`MockDatabase`] has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounts {
    /// Sessions established.
    pub connects: u64,
    /// Connection attempts that failed.
    pub connect_failures: u64,
    /// Prepare round-trips.
    pub prepares: u64,
    /// Execute round-trips.
    pub executes: u64,
    /// Explicit fetch round-trips.
    pub fetches: u64,
    /// Cursor close round-trips.
    pub cursor_closes: u64,
    /// Statement close round-trips.
    pub statement_closes: u64,
    /// Ping round-trips.
    pub pings: u64,
    /// Commits.
    pub commits: u64,
    /// Rollbacks.
    pub rollbacks: u64,
    /// Sessions closed by the client.
    pub session_closes: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    prepares: AtomicU64,
    executes: AtomicU64,
    fetches: AtomicU64,
    cursor_closes: AtomicU64,
    statement_closes: AtomicU64,
    pings: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    session_closes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Default)]
struct Faults {
    failing_connects: u32,
    connect_delay: Option<Duration>,
    execute_errors: VecDeque<TransportError>,
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<HashMap<String, Script>>,
    faults: Mutex<Faults>,
    counters: Counters,
    schema_version: AtomicU64,
    next_statement: AtomicU64,
    next_cursor: AtomicU64,
    open_cursors: AtomicUsize,
    fail_pings: AtomicBool,
    fail_cursor_closes: AtomicBool,
}

/// Shared state behind every [`MockSession`] of one test.
#[derive(Clone, Default)]
pub struct MockDatabase {
    shared: Arc<Shared>,
}

impl MockDatabase {
    /// An empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening sessions against this database.
    #[must_use]
    pub fn connector(&self) -> MockConnector {
        MockConnector { db: self.clone() }
    }

    /// Register a statement.
    pub fn script(&self, sql: impl Into<String>, script: Script) {
        self.shared.scripts.lock().insert(sql.into(), script);
    }

    /// Register a query returning `rows` over `columns`.
    pub fn add_query(&self, sql: impl Into<String>, columns: Vec<Column>, rows: Vec<Vec<SqlValue>>) {
        self.script(
            sql,
            Script {
                kind: StatementKind::Query,
                bind_count: 0,
                columns,
                rows,
                rows_affected: 0,
            },
        );
    }

    /// Register a query returning one INTEGER column `N` with values
    /// `1..=count`.
    pub fn add_numbers(&self, sql: impl Into<String>, count: i64) {
        self.add_query(sql, vec![Column::new("N", 0, ColumnType::Integer)], numbers(count));
    }

    /// Register a query whose second column is a CLOB.
    pub fn add_lob_query(&self, sql: impl Into<String>, count: i64) {
        let columns = vec![
            Column::new("ID", 0, ColumnType::Integer),
            Column::new("DOC", 1, ColumnType::Clob),
        ];
        let rows = (1..=count)
            .map(|n| vec![SqlValue::Int(n), SqlValue::Text(format!("document {n}"))])
            .collect();
        self.add_query(sql, columns, rows);
    }

    /// Register a pipelined query over `1..=count`.
    pub fn add_pipelined(&self, sql: impl Into<String>, count: i64) {
        self.script(
            sql,
            Script {
                kind: StatementKind::PipelinedQuery,
                bind_count: 0,
                columns: vec![Column::new("N", 0, ColumnType::Integer)],
                rows: numbers(count),
                rows_affected: 0,
            },
        );
    }

    /// Register a DML statement.
    pub fn add_dml(&self, sql: impl Into<String>, bind_count: usize, rows_affected: u64) {
        self.script(
            sql,
            Script {
                kind: StatementKind::Dml,
                bind_count,
                columns: Vec::new(),
                rows: Vec::new(),
                rows_affected,
            },
        );
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.faults.lock().failing_connects = n;
    }

    /// Delay every connection attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.faults.lock().connect_delay = Some(delay);
    }

    /// Make every ping fail with a closed connection.
    pub fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::Relaxed);
    }

    /// Make every cursor close fail with a (non-fatal) server error.
    pub fn fail_cursor_closes(&self, fail: bool) {
        self.shared.fail_cursor_closes.store(fail, Ordering::Relaxed);
    }

    /// Fail the next execute, on any session, with `error`.
    pub fn fail_next_execute(&self, error: TransportError) {
        self.shared.faults.lock().execute_errors.push_back(error);
    }

    /// Invalidate every statement prepared so far, as a DDL change would.
    pub fn alter_schema(&self) {
        self.shared.schema_version.fetch_add(1, Ordering::Relaxed);
    }

    /// Server cursors currently open across all sessions.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::Relaxed)
    }

    /// Wire calls served so far.
    #[must_use]
    pub fn counts(&self) -> MockCounts {
        let c = &self.shared.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MockCounts {
            connects: load(&c.connects),
            connect_failures: load(&c.connect_failures),
            prepares: load(&c.prepares),
            executes: load(&c.executes),
            fetches: load(&c.fetches),
            cursor_closes: load(&c.cursor_closes),
            statement_closes: load(&c.statement_closes),
            pings: load(&c.pings),
            commits: load(&c.commits),
            rollbacks: load(&c.rollbacks),
            session_closes: load(&c.session_closes),
        }
    }
}

impl std::fmt::Debug for MockDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDatabase")
            .field("scripts", &self.shared.scripts.lock().len())
            .field("counts", &self.counts())
            .finish()
    }
}

/// Rows `1..=count` of a single INTEGER column.
#[must_use]
pub fn numbers(count: i64) -> Vec<Vec<SqlValue>> {
    (1..=count).map(|n| vec![SqlValue::Int(n)]).collect()
}

/// Opens [`MockSession`]s.
#[derive(Debug, Clone)]
pub struct MockConnector {
    db: MockDatabase,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self) -> Result<MockSession, TransportError> {
        let (delay, fail) = {
            let mut faults = self.db.shared.faults.lock();
            let fail = faults.failing_connects > 0;
            if fail {
                faults.failing_connects -= 1;
            }
            (faults.connect_delay, fail)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            bump(&self.db.shared.counters.connect_failures);
            return Err(TransportError::Connect("connection refused".into()));
        }
        bump(&self.db.shared.counters.connects);
        Ok(MockSession {
            db: self.db.clone(),
            statements: HashMap::new(),
            cursors: HashMap::new(),
            closed: false,
        })
    }
}

struct OpenStatement {
    sql: String,
    schema_version: u64,
}

/// One session against a [`MockDatabase`].
pub struct MockSession {
    db: MockDatabase,
    statements: HashMap<StatementId, OpenStatement>,
    cursors: HashMap<CursorId, VecDeque<Vec<SqlValue>>>,
    closed: bool,
}

impl MockSession {
    fn shared(&self) -> &Shared {
        &self.db.shared
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Server statement handles currently open on this session.
    #[must_use]
    pub fn open_statements(&self) -> usize {
        self.statements.len()
    }

    fn take_rows(&mut self, cursor: CursorId, max_rows: u32) -> RowBatch {
        let Some(remaining) = self.cursors.get_mut(&cursor) else {
            return RowBatch {
                rows: Vec::new(),
                exhausted: true,
            };
        };
        let take = remaining.len().min(max_rows as usize);
        let rows: Vec<_> = remaining.drain(..take).collect();
        let exhausted = rows.len() < max_rows as usize;
        if exhausted {
            self.cursors.remove(&cursor);
            self.shared().open_cursors.fetch_sub(1, Ordering::Relaxed);
        }
        RowBatch { rows, exhausted }
    }
}

#[async_trait]
impl WireSession for MockSession {
    async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement, TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.prepares);

        let script = self.shared().scripts.lock().get(sql).cloned().ok_or_else(|| {
            TransportError::Server {
                code: 942,
                message: "table or view does not exist".into(),
            }
        })?;

        let id = StatementId(self.shared().next_statement.fetch_add(1, Ordering::Relaxed) + 1);
        let schema_version = self.shared().schema_version.load(Ordering::Relaxed);
        self.statements.insert(
            id,
            OpenStatement {
                sql: sql.to_string(),
                schema_version,
            },
        );
        Ok(PreparedStatement {
            id,
            sql: Arc::from(sql),
            bind_count: script.bind_count,
            columns: script.columns.into(),
            kind: script.kind,
        })
    }

    async fn execute(
        &mut self,
        statement: &PreparedStatement,
        _params: &[SqlValue],
        request: ExecuteRequest,
    ) -> Result<Execution, TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.executes);

        let injected = self.shared().faults.lock().execute_errors.pop_front();
        if let Some(error) = injected {
            if error.is_fatal() {
                self.closed = true;
            }
            return Err(error);
        }

        let open = self
            .statements
            .get(&statement.id)
            .ok_or_else(|| TransportError::Server {
                code: 1001,
                message: format!("invalid statement handle {}", statement.id),
            })?;
        if open.schema_version < self.shared().schema_version.load(Ordering::Relaxed) {
            return Err(TransportError::StaleStatement {
                statement: statement.id,
                message: "object definition changed".into(),
            });
        }
        let script = self
            .shared()
            .scripts
            .lock()
            .get(&open.sql)
            .cloned()
            .ok_or_else(|| TransportError::Server {
                code: 942,
                message: "table or view does not exist".into(),
            })?;

        if request.auto_commit {
            bump(&self.shared().counters.commits);
        }

        if !script.kind.returns_rows() {
            return Ok(Execution {
                cursor: None,
                prefetched: RowBatch::default(),
                rows_affected: script.rows_affected,
            });
        }

        let cursor = CursorId(self.shared().next_cursor.fetch_add(1, Ordering::Relaxed) + 1);
        self.cursors.insert(cursor, script.rows.into_iter().collect());
        self.shared().open_cursors.fetch_add(1, Ordering::Relaxed);

        if request.prefetch_rows == 0 {
            return Ok(Execution {
                cursor: Some(cursor),
                prefetched: RowBatch::default(),
                rows_affected: 0,
            });
        }

        let prefetched = self.take_rows(cursor, request.prefetch_rows);
        Ok(Execution {
            cursor: (!prefetched.exhausted).then_some(cursor),
            prefetched,
            rows_affected: 0,
        })
    }

    async fn fetch(&mut self, cursor: CursorId, max_rows: u32) -> Result<RowBatch, TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.fetches);
        if !self.cursors.contains_key(&cursor) {
            return Err(TransportError::Server {
                code: 1002,
                message: format!("fetch out of sequence on {cursor}"),
            });
        }
        Ok(self.take_rows(cursor, max_rows))
    }

    async fn close_cursor(&mut self, cursor: CursorId) -> Result<(), TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.cursor_closes);
        if self.shared().fail_cursor_closes.load(Ordering::Relaxed) {
            return Err(TransportError::Server {
                code: 1001,
                message: format!("invalid cursor {cursor}"),
            });
        }
        if self.cursors.remove(&cursor).is_some() {
            self.shared().open_cursors.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn close_statement(&mut self, statement: StatementId) -> Result<(), TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.statement_closes);
        self.statements.remove(&statement);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.commits);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.rollbacks);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.pings);
        if self.shared().fail_pings.load(Ordering::Relaxed) {
            self.closed = true;
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        bump(&self.shared().counters.session_closes);
        self.closed = true;
        let open = self.cursors.len();
        self.cursors.clear();
        self.shared().open_cursors.fetch_sub(open, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for MockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSession")
            .field("statements", &self.statements.len())
            .field("cursors", &self.cursors.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(prefetch_rows: u32) -> ExecuteRequest {
        ExecuteRequest {
            prefetch_rows,
            auto_commit: false,
        }
    }

    #[tokio::test]
    async fn test_short_batch_releases_cursor() {
        let db = MockDatabase::new();
        db.add_numbers("SELECT n FROM t", 5);
        let mut session = db.connector().connect().await.unwrap();

        let stmt = session.prepare("SELECT n FROM t").await.unwrap();
        let exec = session.execute(&stmt, &[], request(2)).await.unwrap();
        assert_eq!(exec.prefetched.rows.len(), 2);
        let cursor = exec.cursor.unwrap();

        let batch = session.fetch(cursor, 10).await.unwrap();
        assert_eq!(batch.rows.len(), 3);
        assert!(batch.exhausted);
        assert_eq!(db.open_cursors(), 0);
        assert!(session.fetch(cursor, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_schema_change_makes_statements_stale() {
        let db = MockDatabase::new();
        db.add_numbers("SELECT n FROM t", 1);
        let mut session = db.connector().connect().await.unwrap();

        let stmt = session.prepare("SELECT n FROM t").await.unwrap();
        db.alter_schema();
        let err = session.execute(&stmt, &[], request(0)).await.unwrap_err();
        assert!(err.is_stale_statement());
    }

    #[tokio::test]
    async fn test_unknown_sql_is_a_server_error() {
        let db = MockDatabase::new();
        let mut session = db.connector().connect().await.unwrap();
        let err = session.prepare("SELECT * FROM missing").await.unwrap_err();
        assert!(matches!(err, TransportError::Server { code: 942, .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let db = MockDatabase::new();
        db.fail_next_connects(1);
        assert!(db.connector().connect().await.is_err());
        assert!(db.connector().connect().await.is_ok());
        let counts = db.counts();
        assert_eq!(counts.connect_failures, 1);
        assert_eq!(counts.connects, 1);
    }
}
