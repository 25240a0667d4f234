//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a session pool.
///
/// Optional durations disable the corresponding behavior when `None`:
/// no idle timeout keeps idle sessions until close, no ping interval skips
/// validation pings, and no queue timeout lets `acquire` wait indefinitely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Sessions the pool keeps open even when idle.
    pub min_size: u32,
    /// Upper bound on open sessions (idle + busy + opening).
    pub max_size: u32,
    /// Sessions created per growth step.
    pub increment: u32,
    /// Idle sessions unused for longer than this are closed by the sweeper.
    pub idle_timeout: Option<Duration>,
    /// Sessions idle for at least this long are pinged before reuse.
    pub ping_interval: Option<Duration>,
    /// Maximum queued acquire requests once the pool is at `max_size`.
    /// `0` fails acquires immediately when no session is available.
    pub queue_max: usize,
    /// Default wait for a queued acquire.
    pub queue_timeout: Option<Duration>,
    /// Statement cache capacity of each session. `0` disables caching.
    pub statement_cache_size: usize,
    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
    /// Name attached to log lines and metrics.
    pub name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            increment: 1,
            idle_timeout: Some(Duration::from_secs(300)),
            ping_interval: Some(Duration::from_secs(60)),
            queue_max: 500,
            queue_timeout: Some(Duration::from_secs(60)),
            statement_cache_size: 30,
            sweep_interval: Duration::from_secs(30),
            name: None,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;` options string on top of the defaults.
    ///
    /// Recognized keys: `min`, `max`, `increment`, `idle_timeout` (seconds),
    /// `ping_interval` (seconds, negative disables), `queue_max`,
    /// `queue_timeout` (milliseconds, `0` waits forever),
    /// `statement_cache_size`, `sweep_interval` (seconds) and `name`.
    /// Unknown keys are ignored.
    pub fn from_options_str(options: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in options.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "min" | "min_size" | "pool_min" => config.min_size = parse(&key, value)?,
                "max" | "max_size" | "pool_max" => config.max_size = parse(&key, value)?,
                "increment" | "pool_increment" => config.increment = parse(&key, value)?,
                "idle_timeout" | "pool_timeout" => {
                    let secs: u64 = parse(&key, value)?;
                    config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "ping_interval" | "pool_ping_interval" => {
                    let secs: i64 = parse(&key, value)?;
                    config.ping_interval = u64::try_from(secs).ok().map(Duration::from_secs);
                }
                "queue_max" => config.queue_max = parse(&key, value)?,
                "queue_timeout" => {
                    let ms: u64 = parse(&key, value)?;
                    config.queue_timeout = (ms > 0).then(|| Duration::from_millis(ms));
                }
                "statement_cache_size" | "stmt_cache_size" => {
                    config.statement_cache_size = parse(&key, value)?;
                }
                "sweep_interval" => {
                    config.sweep_interval = Duration::from_secs(parse(&key, value)?);
                }
                "name" | "pool_alias" => config.name = Some(value.to_string()),
                _ => {
                    tracing::debug!(key = key.as_str(), "ignoring unknown pool option");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min_size(mut self, count: u32) -> Self {
        self.min_size = count;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_size(mut self, count: u32) -> Self {
        self.max_size = count;
        self
    }

    /// Set the growth step.
    #[must_use]
    pub fn increment(mut self, count: u32) -> Self {
        self.increment = count;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the ping interval. `Duration::ZERO` pings on every reuse.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Never ping sessions before reuse.
    #[must_use]
    pub fn no_ping(mut self) -> Self {
        self.ping_interval = None;
        self
    }

    /// Set the wait queue bound.
    #[must_use]
    pub fn queue_max(mut self, max: usize) -> Self {
        self.queue_max = max;
        self
    }

    /// Set the default acquire timeout.
    #[must_use]
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    /// Set the per-session statement cache capacity.
    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Set the sweeper interval.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the pool name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Config("max_size must be greater than 0".into()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Config(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.increment == 0 {
            return Err(PoolError::Config("increment must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(PoolError::Config("sweep_interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Config(format!("invalid value for {key}: {value}")))
}
