//! Tracing helpers and OpenTelemetry metrics for sessions and pools.
//!
//! SQL text is sanitized before it reaches a log line or span attribute:
//! string and numeric literals are replaced by a placeholder and the result
//! is truncated.
//!
//! With the `otel` feature enabled, [`PoolMetricsRecorder`] publishes pool
//! gauges and counters through the global OpenTelemetry meter. Without it the
//! recorder compiles to no-ops.

#[cfg(feature = "otel")]
use opentelemetry::{KeyValue, global};

/// Instrumentation scope name.
pub const SCOPE: &str = "dbkit";

/// Span and event names.
pub mod span_names {
    /// Acquiring a session from a pool.
    pub const ACQUIRE: &str = "dbkit.acquire";
    /// Returning a session to a pool.
    pub const RELEASE: &str = "dbkit.release";
    /// Executing a statement.
    pub const EXECUTE: &str = "dbkit.execute";
    /// Fetching a batch of rows.
    pub const FETCH: &str = "dbkit.fetch";
}

/// Metric names following the database client semantic conventions.
pub mod metric_names {
    /// Gauge: sessions currently in use.
    pub const CONNECTIONS_USAGE: &str = "db.client.connections.usage";
    /// Gauge: idle sessions.
    pub const CONNECTIONS_IDLE: &str = "db.client.connections.idle";
    /// Gauge: maximum sessions.
    pub const CONNECTIONS_MAX: &str = "db.client.connections.max";
    /// Gauge: pending acquire requests.
    pub const CONNECTIONS_PENDING: &str = "db.client.connections.pending_requests";
    /// Counter: sessions created.
    pub const CONNECTIONS_CREATE_TOTAL: &str = "db.client.connections.create.total";
    /// Counter: acquire timeouts.
    pub const CONNECTIONS_TIMEOUTS: &str = "db.client.connections.timeouts";
    /// Histogram: time spent waiting for a session.
    pub const CONNECTIONS_WAIT_TIME: &str = "db.client.connections.wait_time";
}

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to replace literals.
    pub enabled: bool,
    /// Maximum length of the recorded statement, in characters.
    pub max_length: usize,
    /// Placeholder for removed literals.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// A configuration that records statements verbatim.
    #[must_use]
    pub fn no_sanitization() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Sanitize and truncate a SQL statement.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if self.enabled {
            truncate(&replace_literals(sql, &self.placeholder), self.max_length)
        } else {
            truncate(sql, self.max_length)
        }
    }
}

fn replace_literals(sql: &str, placeholder: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                // doubled quote is an escaped quote
                if chars.peek() == Some(&q) {
                    chars.next();
                    continue;
                }
                quote = None;
                out.push_str(placeholder);
            }
            continue;
        }

        match c {
            '\'' => quote = Some(c),
            c if c.is_ascii_digit()
                && !out.ends_with(|p: char| p.is_alphanumeric() || p == '_' || p == ':') =>
            {
                while chars
                    .peek()
                    .is_some_and(|n| n.is_ascii_digit() || *n == '.')
                {
                    chars.next();
                }
                out.push_str(placeholder);
            }
            c => out.push(c),
        }
    }

    if quote.is_some() {
        out.push_str(placeholder);
    }
    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Leading keyword of a statement, upper-cased, for span and log fields.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" => "SELECT",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "MERGE" => "MERGE",
        "CALL" | "BEGIN" | "DECLARE" => "CALL",
        "COMMIT" => "COMMIT",
        "ROLLBACK" => "ROLLBACK",
        "CREATE" => "CREATE",
        "ALTER" => "ALTER",
        "DROP" => "DROP",
        _ => "OTHER",
    }
}

/// Publishes pool gauges and counters.
#[cfg(feature = "otel")]
pub struct PoolMetricsRecorder {
    usage: opentelemetry::metrics::Gauge<u64>,
    idle: opentelemetry::metrics::Gauge<u64>,
    max: opentelemetry::metrics::Gauge<u64>,
    pending: opentelemetry::metrics::Gauge<u64>,
    created: opentelemetry::metrics::Counter<u64>,
    timeouts: opentelemetry::metrics::Counter<u64>,
    wait_time: opentelemetry::metrics::Histogram<f64>,
    attributes: Vec<KeyValue>,
}

#[cfg(feature = "otel")]
impl PoolMetricsRecorder {
    /// Create a recorder; `pool_name` is attached to every data point.
    #[must_use]
    pub fn new(pool_name: Option<&str>) -> Self {
        let meter = global::meter(SCOPE);
        let mut attributes = Vec::new();
        if let Some(name) = pool_name {
            attributes.push(KeyValue::new("db.client.pool.name", name.to_string()));
        }

        Self {
            usage: meter
                .u64_gauge(metric_names::CONNECTIONS_USAGE)
                .with_description("Sessions currently in use")
                .build(),
            idle: meter
                .u64_gauge(metric_names::CONNECTIONS_IDLE)
                .with_description("Idle sessions")
                .build(),
            max: meter
                .u64_gauge(metric_names::CONNECTIONS_MAX)
                .with_description("Maximum sessions")
                .build(),
            pending: meter
                .u64_gauge(metric_names::CONNECTIONS_PENDING)
                .with_description("Queued acquire requests")
                .build(),
            created: meter
                .u64_counter(metric_names::CONNECTIONS_CREATE_TOTAL)
                .with_description("Sessions created")
                .build(),
            timeouts: meter
                .u64_counter(metric_names::CONNECTIONS_TIMEOUTS)
                .with_description("Acquire requests that timed out")
                .build(),
            wait_time: meter
                .f64_histogram(metric_names::CONNECTIONS_WAIT_TIME)
                .with_description("Time spent waiting for a session")
                .with_unit("s")
                .build(),
            attributes,
        }
    }

    /// Record current occupancy.
    pub fn record_status(&self, busy: u64, idle: u64, max: u64, pending: u64) {
        self.usage.record(busy, &self.attributes);
        self.idle.record(idle, &self.attributes);
        self.max.record(max, &self.attributes);
        self.pending.record(pending, &self.attributes);
    }

    /// Record a created session.
    pub fn record_created(&self) {
        self.created.add(1, &self.attributes);
    }

    /// Record an acquire timeout.
    pub fn record_timeout(&self) {
        self.timeouts.add(1, &self.attributes);
    }

    /// Record the time an acquire waited.
    pub fn record_wait(&self, seconds: f64) {
        self.wait_time.record(seconds, &self.attributes);
    }
}

#[cfg(feature = "otel")]
impl std::fmt::Debug for PoolMetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetricsRecorder")
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// No-op recorder when the `otel` feature is disabled.
#[cfg(not(feature = "otel"))]
#[derive(Debug, Clone, Default)]
pub struct PoolMetricsRecorder;

#[cfg(not(feature = "otel"))]
impl PoolMetricsRecorder {
    /// Create a no-op recorder.
    #[must_use]
    pub fn new(_pool_name: Option<&str>) -> Self {
        Self
    }

    /// Record current occupancy (no-op).
    pub fn record_status(&self, _busy: u64, _idle: u64, _max: u64, _pending: u64) {}

    /// Record a created session (no-op).
    pub fn record_created(&self) {}

    /// Record an acquire timeout (no-op).
    pub fn record_timeout(&self) {}

    /// Record the time an acquire waited (no-op).
    pub fn record_wait(&self, _seconds: f64) {}
}
