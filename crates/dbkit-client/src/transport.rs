//! The wire session seam.
//!
//! A [`WireSession`] is one physical connection to a database server. It owns
//! the socket and the request/response codec and performs exactly one
//! round-trip per method call. Everything above this trait (statement
//! caching, fetch buffering, pooling) is protocol independent.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::row::Column;
use crate::value::SqlValue;

/// Identity of one session, unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Server-side handle of a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(pub u64);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt-{}", self.0)
    }
}

/// Server-side handle of an open result cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor-{}", self.0)
    }
}

/// What kind of rows, if any, a statement produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementKind {
    /// Returns a result set materialized by the server.
    #[default]
    Query,
    /// Returns rows produced lazily by a pipelined source. Rows must not be
    /// pulled before the caller asks for them.
    PipelinedQuery,
    /// INSERT, UPDATE, DELETE, MERGE.
    Dml,
    /// DDL, procedure calls and anything else.
    Other,
}

impl StatementKind {
    /// Whether executing the statement opens a cursor.
    #[must_use]
    pub fn returns_rows(self) -> bool {
        matches!(self, Self::Query | Self::PipelinedQuery)
    }
}

/// A statement prepared on the server, with the metadata returned by the
/// prepare round-trip.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server handle.
    pub id: StatementId,
    /// Exact SQL text the statement was prepared from.
    pub sql: Arc<str>,
    /// Number of bind placeholders.
    pub bind_count: usize,
    /// Result column descriptors (empty for statements without rows).
    pub columns: Arc<[Column]>,
    /// Statement kind.
    pub kind: StatementKind,
}

impl PreparedStatement {
    /// Whether the result can be delivered eagerly alongside the execute
    /// acknowledgment.
    ///
    /// Large objects and pipelined sources cannot: prefetching would consume
    /// rows (or LOB locators) the caller never asked for.
    #[must_use]
    pub fn allows_prefetch(&self) -> bool {
        self.kind != StatementKind::PipelinedQuery
            && !self.columns.iter().any(|c| c.column_type.is_lob())
    }
}

/// Per-execution parameters passed down to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Rows the server may return eagerly with the execute response.
    pub prefetch_rows: u32,
    /// Commit the transaction as part of the same round-trip.
    pub auto_commit: bool,
}

/// A batch of rows returned by one round-trip.
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    /// Row values in result order.
    pub rows: Vec<Vec<SqlValue>>,
    /// The server cursor has no more rows and has been released.
    pub exhausted: bool,
}

/// Response to an execute round-trip.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Open cursor, when the statement returns rows and rows remain.
    pub cursor: Option<CursorId>,
    /// Rows delivered with the execute acknowledgment (at most the
    /// requested prefetch).
    pub prefetched: RowBatch,
    /// Rows affected, for DML.
    pub rows_affected: u64,
}

/// Errors reported by a wire session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// I/O failure on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server rejected the request.
    #[error("server error {code}: {message}")]
    Server {
        /// Vendor error code.
        code: i32,
        /// Server message.
        message: String,
    },

    /// The server no longer recognizes a prepared statement handle
    /// (for example after a schema change).
    #[error("prepared statement {statement} is stale: {message}")]
    StaleStatement {
        /// The rejected handle.
        statement: StatementId,
        /// Server message.
        message: String,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Establishing the session failed.
    #[error("connect failed: {0}")]
    Connect(String),
}

impl TransportError {
    /// Whether the session that produced this error can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::Connect(_)
        )
    }

    /// Whether the error indicates a cached statement handle is invalid.
    #[must_use]
    pub fn is_stale_statement(&self) -> bool {
        matches!(self, Self::StaleStatement { .. })
    }
}

/// One physical connection to a database server.
///
/// Implementations perform the actual wire calls. Each method is one
/// round-trip.
#[async_trait]
pub trait WireSession: Send + 'static {
    /// Prepare `sql` and describe its binds and result columns.
    async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement, TransportError>;

    /// Execute a prepared statement.
    async fn execute(
        &mut self,
        statement: &PreparedStatement,
        params: &[SqlValue],
        request: ExecuteRequest,
    ) -> Result<Execution, TransportError>;

    /// Fetch up to `max_rows` rows from an open cursor.
    async fn fetch(&mut self, cursor: CursorId, max_rows: u32)
        -> Result<RowBatch, TransportError>;

    /// Release a server cursor.
    async fn close_cursor(&mut self, cursor: CursorId) -> Result<(), TransportError>;

    /// Release a server statement handle.
    async fn close_statement(&mut self, statement: StatementId) -> Result<(), TransportError>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), TransportError>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<(), TransportError>;

    /// Lightweight liveness check.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for wire sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: WireSession;

    /// Establish a new session.
    async fn connect(&self) -> Result<Self::Session, TransportError>;
}
