//! # dbkit-client
//!
//! Session-level building blocks for an async database driver.
//!
//! A [`Connection`] wraps one physical [`WireSession`] with a per-session
//! statement cache and fetch buffering. The wire protocol itself lives
//! behind the [`WireSession`] and [`Connector`] traits, so everything in
//! this crate is protocol independent.
//!
//! ## Features
//!
//! - **Statement caching**: LRU cache of prepared statements per session,
//!   with in-flight statements pinned against eviction
//! - **Prefetch and array fetch**: first rows arrive with the execute
//!   acknowledgment, the rest in `array_size` batches
//! - **Streaming**: cursors can be consumed as a `Stream` of rows
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbkit_client::{Connection, ExecuteOptions, SessionId, StatementCache};
//!
//! let mut conn = Connection::new(SessionId(1), wire, StatementCache::new(30));
//! let options = ExecuteOptions::new().array_size(500).prefetch_size(501);
//!
//! let mut cursor = conn.query("SELECT id, name FROM emp", &[], &options).await?;
//! while let Some(row) = cursor.next().await? {
//!     let name: String = row.get_by_name("NAME")?;
//!     println!("{name}");
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod fetch;
pub mod instrumentation;
pub mod options;
pub mod row;
pub mod statement_cache;
pub mod transport;
pub mod value;

pub use connection::Connection;
pub use error::{Error, Result};
pub use fetch::{Cursor, FetchWindow};
pub use instrumentation::{PoolMetricsRecorder, SanitizationConfig};
pub use options::ExecuteOptions;
pub use row::{Column, ColumnType, Row};
pub use statement_cache::{CacheCounters, StatementCache, StatementHandle};
pub use transport::{
    Connector, CursorId, ExecuteRequest, Execution, PreparedStatement, RowBatch, SessionId,
    StatementId, StatementKind, TransportError, WireSession,
};
pub use value::{FromSql, SqlValue, TypeError};
