//! Per-session prepared statement cache.
//!
//! Maps exact SQL text to a server-side prepared statement. Entries carry a
//! reference count of in-flight executions; only unreferenced entries are
//! evicted, least recently used first. When every entry is referenced and
//! the cache is full, new statements bypass the cache instead of blocking.
//!
//! The cache never talks to the server itself. Handles that leave the cache
//! (eviction, invalidation, uncached executions) are queued as orphans and
//! closed by the owning connection before its next round-trip.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use lru::LruCache;

use crate::transport::{PreparedStatement, StatementId};

/// Hit and miss counters shared by every cache of a pool.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative cache hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cumulative cache misses, including bypassed lookups.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// A reference to a prepared statement held by one execution.
///
/// Every handle obtained from [`StatementCache::lookup`] or
/// [`StatementCache::insert`] must be given back through
/// [`StatementCache::release`].
#[derive(Debug)]
pub struct StatementHandle {
    statement: Arc<PreparedStatement>,
    cached: bool,
}

impl StatementHandle {
    /// The prepared statement.
    #[must_use]
    pub fn statement(&self) -> &PreparedStatement {
        &self.statement
    }

    /// Server handle.
    #[must_use]
    pub fn id(&self) -> StatementId {
        self.statement.id
    }

    /// SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.statement.sql
    }

    /// Whether the statement was served from, or stored in, the cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

#[derive(Debug)]
struct CacheEntry {
    statement: Arc<PreparedStatement>,
    refs: usize,
    keep_in_cache: bool,
}

/// LRU statement cache with reference-counted entries.
#[derive(Debug)]
pub struct StatementCache {
    entries: LruCache<Arc<str>, CacheEntry>,
    capacity: usize,
    /// Entries removed while still referenced: remaining references.
    detached: HashMap<StatementId, usize>,
    /// Server handles waiting to be closed.
    orphans: Vec<StatementId>,
    hits: u64,
    misses: u64,
    counters: Arc<CacheCounters>,
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements.
    ///
    /// A capacity of 0 disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_counters(capacity, Arc::new(CacheCounters::new()))
    }

    /// Create a cache that also reports into shared counters.
    #[must_use]
    pub fn with_counters(capacity: usize, counters: Arc<CacheCounters>) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            detached: HashMap::new(),
            orphans: Vec::new(),
            hits: 0,
            misses: 0,
            counters,
        }
    }

    /// Look up `sql` byte for byte.
    ///
    /// On a hit the entry's reference count is incremented and it becomes
    /// the most recently used. With `keep_in_cache == false` the entry is
    /// dropped from the cache once its last reference is released.
    pub fn lookup(&mut self, sql: &str, keep_in_cache: bool) -> Option<StatementHandle> {
        let Some(entry) = self.entries.get_mut(sql) else {
            self.record_miss();
            return None;
        };

        entry.refs += 1;
        if !keep_in_cache {
            entry.keep_in_cache = false;
        }
        let refs = entry.refs;
        let statement = Arc::clone(&entry.statement);
        self.record_hit();
        tracing::trace!(statement = %statement.id, refs, "statement cache hit");

        Some(StatementHandle {
            statement,
            cached: true,
        })
    }

    /// Insert a freshly prepared statement and return a handle to it.
    ///
    /// At capacity the least recently used unreferenced entry is evicted.
    /// If none can be evicted, or caching is disabled, or the caller asked
    /// not to keep the statement, the returned handle is uncached.
    pub fn insert(&mut self, statement: PreparedStatement, keep_in_cache: bool) -> StatementHandle {
        let statement = Arc::new(statement);

        if !keep_in_cache || self.capacity == 0 || self.entries.contains(&*statement.sql) {
            return Self::uncached(statement);
        }

        if self.entries.len() >= self.capacity && !self.evict_unreferenced() {
            tracing::debug!(
                capacity = self.capacity,
                "statement cache full of in-flight statements, bypassing"
            );
            return Self::uncached(statement);
        }

        self.entries.push(
            Arc::clone(&statement.sql),
            CacheEntry {
                statement: Arc::clone(&statement),
                refs: 1,
                keep_in_cache: true,
            },
        );

        StatementHandle {
            statement,
            cached: true,
        }
    }

    /// Give back a handle after its execution finished.
    pub fn release(&mut self, handle: StatementHandle) {
        let id = handle.id();
        if !handle.cached {
            self.orphans.push(id);
            return;
        }

        if let Some(entry) = self.entries.peek_mut(handle.sql()) {
            if entry.statement.id == id {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs == 0 && !entry.keep_in_cache {
                    self.entries.pop(handle.sql());
                    self.orphans.push(id);
                }
                return;
            }
        }

        if let Some(refs) = self.detached.get_mut(&id) {
            *refs -= 1;
            if *refs == 0 {
                self.detached.remove(&id);
                self.orphans.push(id);
            }
        }
    }

    /// Remove the handle's entry regardless of its reference count.
    ///
    /// Used when the server reports the prepared plan as stale. The next
    /// lookup of the same text misses and re-prepares.
    pub fn invalidate(&mut self, handle: &StatementHandle) {
        let id = handle.id();
        let matches = self
            .entries
            .peek(handle.sql())
            .is_some_and(|entry| entry.statement.id == id);
        if !matches {
            return;
        }

        if let Some(entry) = self.entries.pop(handle.sql()) {
            tracing::debug!(statement = %id, refs = entry.refs, "invalidated cached statement");
            self.detach(entry);
        }
    }

    /// Resize the cache. Capacity 0 disables caching.
    ///
    /// Unreferenced entries are evicted LRU first; if referenced entries
    /// still exceed the new capacity they are detached.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            if self.evict_unreferenced() {
                continue;
            }
            if let Some((_, entry)) = self.entries.pop_lru() {
                self.detach(entry);
            }
        }
    }

    /// Server handles that must be closed; clears the queue.
    pub fn take_orphans(&mut self) -> Vec<StatementId> {
        std::mem::take(&mut self.orphans)
    }

    /// Whether `sql` is cached.
    #[must_use]
    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains(sql)
    }

    /// Reference count of the entry for `sql`, if cached.
    #[must_use]
    pub fn ref_count(&self, sql: &str) -> Option<usize> {
        self.entries.peek(sql).map(|entry| entry.refs)
    }

    /// Number of cached statements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hits on this cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Misses on this cache.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Hit rate between 0.0 and 1.0.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let rate = self.hits as f64 / total as f64;
            rate
        }
    }

    fn uncached(statement: Arc<PreparedStatement>) -> StatementHandle {
        StatementHandle {
            statement,
            cached: false,
        }
    }

    /// Evict the least recently used entry with no references.
    fn evict_unreferenced(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .rev()
            .find(|(_, entry)| entry.refs == 0)
            .map(|(sql, _)| Arc::clone(sql));

        let Some(sql) = victim else {
            return false;
        };
        if let Some(entry) = self.entries.pop(&sql) {
            tracing::trace!(statement = %entry.statement.id, "evicted cached statement");
            self.orphans.push(entry.statement.id);
        }
        true
    }

    fn detach(&mut self, entry: CacheEntry) {
        if entry.refs == 0 {
            self.orphans.push(entry.statement.id);
        } else {
            self.detached.insert(entry.statement.id, entry.refs);
        }
    }

    fn record_hit(&mut self) {
        self.hits += 1;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&mut self) {
        self.misses += 1;
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }
}
