//! Per-statement execution options.

use crate::error::{Error, Result};
use crate::transport::{ExecuteRequest, PreparedStatement};

/// Default number of rows requested per fetch call.
pub const DEFAULT_ARRAY_SIZE: u32 = 100;

/// Default number of rows delivered with the execute acknowledgment.
pub const DEFAULT_PREFETCH_SIZE: u32 = 2;

/// Options applied to one statement execution.
///
/// `array_size` sizes each explicit fetch call; `prefetch_size` lets the
/// server deliver the first rows with the execute response. Setting
/// `prefetch_size` to `array_size + 1` lets a result of exactly
/// `array_size` rows complete in a single round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Rows requested per fetch round-trip.
    pub array_size: u32,
    /// Rows the server may return eagerly. `0` defers all rows until the
    /// first `next()`.
    pub prefetch_size: u32,
    /// Keep the prepared statement in the session's statement cache.
    pub keep_in_cache: bool,
    /// Commit in the same round-trip as the execution.
    pub auto_commit: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            array_size: DEFAULT_ARRAY_SIZE,
            prefetch_size: DEFAULT_PREFETCH_SIZE,
            keep_in_cache: true,
            auto_commit: false,
        }
    }
}

impl ExecuteOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the array fetch size.
    #[must_use]
    pub fn array_size(mut self, rows: u32) -> Self {
        self.array_size = rows;
        self
    }

    /// Set the prefetch size.
    #[must_use]
    pub fn prefetch_size(mut self, rows: u32) -> Self {
        self.prefetch_size = rows;
        self
    }

    /// Keep (or skip) the statement in the cache.
    #[must_use]
    pub fn keep_in_cache(mut self, keep: bool) -> Self {
        self.keep_in_cache = keep;
        self
    }

    /// Commit as part of the execution.
    #[must_use]
    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Check option values.
    pub fn validate(&self) -> Result<()> {
        if self.array_size == 0 {
            return Err(Error::Config("array_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Build the wire request for `statement`, dropping prefetch where the
    /// result cannot be eagerly materialized.
    #[must_use]
    pub fn request_for(&self, statement: &PreparedStatement) -> ExecuteRequest {
        let prefetch_rows = if statement.kind.returns_rows() && statement.allows_prefetch() {
            self.prefetch_size
        } else {
            0
        };
        ExecuteRequest {
            prefetch_rows,
            auto_commit: self.auto_commit,
        }
    }
}
