//! # dbkit-pool
//!
//! Session pool for `dbkit-client` connections.
//!
//! ## Features
//!
//! - Min/max sizing with serialized growth in `increment` steps
//! - FIFO wait queue with per-acquire timeout and a queue bound
//! - Validation ping for sessions idle longer than `ping_interval`
//! - Pluggable reset strategy run on every release
//! - Background sweeper closing sessions past `idle_timeout`
//! - Drain-with-timeout on close
//! - Statistics snapshot, including statement cache hit rates
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use dbkit_pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::from_options_str("min=2;max=8;increment=2")?;
//! let pool = Pool::new(connector, config).await?;
//!
//! let conn = pool.acquire_timeout(Duration::from_secs(5)).await?;
//! // Use connection...
//! conn.release().await;
//!
//! let stats = pool.statistics();
//! println!("Pool utilization: {:.1}%", stats.utilization());
//!
//! pool.close(Duration::from_secs(10)).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod stats;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{AcquireOptions, Pool, PoolBuilder, PooledConnection};

// Lifecycle management
pub use lifecycle::{
    DynSessionReset, RollbackReset, SessionMetadata, SessionReset, SessionState,
};

// Statistics
pub use stats::PoolStatistics;
