//! # dbkit-testing
//!
//! Test infrastructure for the dbkit crates.
//!
//! Provides an in-memory [`WireSession`](dbkit_client::WireSession) with
//! scripted statements, fault injection and wire-call counters, plus small
//! helpers for building pools against it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbkit_testing::{MockDatabase, pool_config};
//!
//! let db = MockDatabase::new();
//! db.add_numbers("SELECT n FROM t", 10);
//!
//! let pool = dbkit_pool::Pool::new(db.connector(), pool_config(0, 2)).await?;
//! let mut conn = pool.acquire().await?;
//! let rows = conn.query("SELECT n FROM t", &[], &Default::default()).await?.fetch_all().await?;
//! assert_eq!(rows.len(), 10);
//! assert_eq!(db.counts().executes, 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

use std::time::Duration;

use dbkit_pool::PoolConfig;

pub use mock::{MockConnector, MockCounts, MockDatabase, MockSession, Script, numbers};

/// Install a test-friendly `tracing` subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Pool configuration for tests: explicit bounds, no pings, a sweeper that
/// stays out of the way.
#[must_use]
pub fn pool_config(min_size: u32, max_size: u32) -> PoolConfig {
    PoolConfig::new()
        .min_size(min_size)
        .max_size(max_size)
        .no_ping()
        .sweep_interval(Duration::from_secs(3600))
}
