//! Pool statistics.

use std::time::Duration;

/// Cumulative counters maintained by the pool.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolCounters {
    pub(crate) sessions_created: u64,
    pub(crate) sessions_closed: u64,
    pub(crate) acquires_successful: u64,
    pub(crate) acquires_failed: u64,
    pub(crate) acquire_timeouts: u64,
    pub(crate) pings: u64,
    pub(crate) ping_failures: u64,
    pub(crate) resets: u64,
    pub(crate) reset_failures: u64,
}

/// Point-in-time snapshot of pool occupancy and cumulative counters.
#[derive(Debug, Clone)]
pub struct PoolStatistics {
    /// Open sessions (idle + busy).
    pub sessions_open: u32,
    /// Sessions checked out, including those being validated on release.
    pub sessions_busy: u32,
    /// Sessions in the idle set.
    pub sessions_idle: u32,
    /// Sessions being established.
    pub sessions_opening: u32,
    /// Queued acquire requests.
    pub pending_requests: usize,
    /// Configured maximum.
    pub max_size: u32,
    /// Sessions created since the pool started.
    pub sessions_created: u64,
    /// Sessions closed since the pool started.
    pub sessions_closed: u64,
    /// Successful acquires.
    pub acquires_successful: u64,
    /// Failed acquires (timeouts included).
    pub acquires_failed: u64,
    /// Acquires that timed out in the wait queue.
    pub acquire_timeouts: u64,
    /// Validation pings sent.
    pub pings: u64,
    /// Validation pings that failed.
    pub ping_failures: u64,
    /// Reset strategy invocations.
    pub resets: u64,
    /// Reset strategy failures.
    pub reset_failures: u64,
    /// Statement cache hits across all sessions.
    pub statement_cache_hits: u64,
    /// Statement cache misses across all sessions.
    pub statement_cache_misses: u64,
    /// Time since the pool was created.
    pub uptime: Duration,
}

impl PoolStatistics {
    /// Busy sessions as a percentage of the maximum.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        (f64::from(self.sessions_busy) / f64::from(self.max_size)) * 100.0
    }

    /// Whether no more sessions can be created.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.sessions_open + self.sessions_opening >= self.max_size
    }

    /// Fraction of acquires that succeeded (0.0 to 1.0).
    #[must_use]
    pub fn acquire_success_rate(&self) -> f64 {
        let total = self.acquires_successful + self.acquires_failed;
        if total == 0 {
            return 1.0;
        }
        self.acquires_successful as f64 / total as f64
    }

    /// Fraction of validation pings that succeeded (0.0 to 1.0).
    #[must_use]
    pub fn ping_success_rate(&self) -> f64 {
        if self.pings == 0 {
            return 1.0;
        }
        (self.pings - self.ping_failures) as f64 / self.pings as f64
    }

    /// Statement cache hit rate (0.0 to 1.0).
    #[must_use]
    pub fn statement_cache_hit_rate(&self) -> f64 {
        let total = self.statement_cache_hits + self.statement_cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.statement_cache_hits as f64 / total as f64
    }
}
