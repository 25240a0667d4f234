//! Session pool implementation.
//!
//! One mutex guards the idle set, the busy set, the wait queue and the size
//! counters, so a release and the handoff to the oldest waiter happen in a
//! single critical section. Wire round-trips (connect, ping, reset, close)
//! always run outside the lock.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dbkit_client::instrumentation::span_names;
use dbkit_client::{
    CacheCounters, Connection, Connector, PoolMetricsRecorder, SessionId, StatementCache,
    TransportError, WireSession,
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::{DynSessionReset, SessionMetadata, SessionReset, SessionState};
use crate::stats::{PoolCounters, PoolStatistics};

/// Pause between a failed session creation and the retry made for waiters
/// still queued behind the one that received the error.
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A pool of database sessions.
///
/// `Pool` is a cheap cloneable handle; clones share the same sessions. The
/// pool keeps at least `min_size` sessions open, grows by `increment` up to
/// `max_size` when callers are waiting, and queues acquires FIFO once at
/// capacity. A background sweeper closes sessions idle longer than
/// `idle_timeout`.
///
/// # Example
///
/// ```rust,ignore
/// use dbkit_pool::{Pool, PoolConfig, RollbackReset};
///
/// let pool = Pool::builder(connector)
///     .config(PoolConfig::new().min_size(2).max_size(16))
///     .reset(RollbackReset)
///     .build()
///     .await?;
///
/// let mut conn = pool.acquire().await?;
/// let affected = conn.execute("DELETE FROM jobs WHERE done = 1", &[], &Default::default()).await?;
/// conn.commit().await?;
/// conn.release().await;
/// ```
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    reset: Option<DynSessionReset<C::Session>>,
    state: Mutex<PoolState<C::Session>>,
    counters: Mutex<PoolCounters>,
    cache_counters: Arc<CacheCounters>,
    next_session_id: AtomicU64,
    /// Woken whenever a session leaves the busy set.
    drained: Notify,
    sweeper: CancellationToken,
    recorder: PoolMetricsRecorder,
    created_at: Instant,
    /// Runtime the pool was created on; drops and growth spawn onto it.
    runtime: Handle,
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

struct Slot<S: WireSession> {
    conn: Connection<S>,
    checkouts: u64,
}

impl<S: WireSession> Slot<S> {
    fn new(conn: Connection<S>) -> Self {
        Self { conn, checkouts: 0 }
    }
}

struct IdleEntry<S: WireSession> {
    slot: Slot<S>,
    since: Instant,
}

type Delivery<S> = Result<Slot<S>, PoolError>;

struct Waiter<S: WireSession> {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Delivery<S>>,
}

struct PoolState<S: WireSession> {
    config: PoolConfig,
    /// Oldest idle at the front.
    idle: VecDeque<IdleEntry<S>>,
    busy: HashMap<SessionId, SessionState>,
    /// Creations in flight; they count toward `max_size`.
    opening: usize,
    growing: bool,
    waiters: VecDeque<Waiter<S>>,
    next_request: u64,
    closed: bool,
}

impl<S: WireSession> PoolState<S> {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: VecDeque::new(),
            busy: HashMap::new(),
            opening: 0,
            growing: false,
            waiters: VecDeque::new(),
            next_request: 1,
            closed: false,
        }
    }

    fn open(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    fn total(&self) -> usize {
        self.open() + self.opening
    }

    fn max_size(&self) -> usize {
        self.config.max_size as usize
    }

    /// Sessions the next growth step should create.
    fn growth_needed(&self) -> usize {
        let total = self.total();
        let max = self.max_size();
        if self.closed || total >= max {
            return 0;
        }
        let waiting = self.waiters.len().saturating_sub(self.opening);
        let below_min = (self.config.min_size as usize).saturating_sub(total);
        waiting
            .max(below_min)
            .min(self.config.increment as usize)
            .min(max - total)
    }

    /// Most recently used idle session, preferring one whose tag matches.
    fn take_idle(&mut self, tag: Option<&str>) -> Option<IdleEntry<S>> {
        if let Some(tag) = tag {
            if let Some(pos) = self
                .idle
                .iter()
                .rposition(|entry| entry.slot.conn.tag() == Some(tag))
            {
                return self.idle.remove(pos);
            }
        }
        self.idle.pop_back()
    }

    /// Hand `slot` to the oldest waiter, else park it in the idle set.
    ///
    /// Returns the slot when the pool is closed and it must be closed.
    fn place(&mut self, mut slot: Slot<S>) -> Option<Slot<S>> {
        if self.closed {
            return Some(slot);
        }
        let id = slot.conn.id();
        while let Some(waiter) = self.waiters.pop_front() {
            self.busy.insert(id, SessionState::Busy);
            match waiter.tx.send(Ok(slot)) {
                Ok(()) => {
                    tracing::trace!(
                        session = %id,
                        request = waiter.id,
                        waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                        "handed session to waiter"
                    );
                    return None;
                }
                Err(returned) => {
                    self.busy.remove(&id);
                    match returned {
                        Ok(returned) => slot = returned,
                        Err(_) => return None,
                    }
                }
            }
        }
        self.idle.push_back(IdleEntry {
            slot,
            since: Instant::now(),
        });
        None
    }

    /// Remove a queued request. `false` if it was already fulfilled.
    fn withdraw(&mut self, request: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == request) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Per-acquire options.
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// How long to wait in the queue. `None` uses the pool's
    /// `queue_timeout`.
    pub timeout: Option<Duration>,
    /// Preferred session tag.
    pub tag: Option<String>,
}

impl AcquireOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wait timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Prefer an idle session carrying `tag`.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

enum Step<S: WireSession> {
    Idle(Slot<S>),
    Queued(u64, oneshot::Receiver<Delivery<S>>),
}

impl<C: Connector> Pool<C> {
    /// Create a pool builder around `connector`.
    #[must_use]
    pub fn builder(connector: C) -> PoolBuilder<C> {
        PoolBuilder::new(connector)
    }

    /// Create a pool and open its `min_size` sessions.
    ///
    /// For a reset strategy, use [`Pool::builder()`].
    pub async fn new(connector: C, config: PoolConfig) -> Result<Self, PoolError> {
        Self::create(connector, config, None).await
    }

    async fn create(
        connector: C,
        config: PoolConfig,
        reset: Option<DynSessionReset<C::Session>>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| PoolError::Config("pool must be created inside a tokio runtime".into()))?;

        let inner = Arc::new(PoolInner {
            connector,
            reset,
            recorder: PoolMetricsRecorder::new(config.name.as_deref()),
            state: Mutex::new(PoolState::new(config.clone())),
            counters: Mutex::new(PoolCounters::default()),
            cache_counters: Arc::new(CacheCounters::new()),
            next_session_id: AtomicU64::new(1),
            drained: Notify::new(),
            sweeper: CancellationToken::new(),
            created_at: Instant::now(),
            runtime,
        });
        let pool = Self { inner };

        for _ in 0..config.min_size {
            match pool.inner.open_session().await {
                Ok(conn) => {
                    pool.inner.state.lock().idle.push_back(IdleEntry {
                        slot: Slot::new(conn),
                        since: Instant::now(),
                    });
                }
                Err(error) => {
                    tracing::warn!(error = %error, "failed to open initial sessions");
                    let _ = pool.close(Duration::ZERO).await;
                    return Err(PoolError::SessionCreateFailed(error));
                }
            }
        }

        spawn_sweeper(&pool.inner, config.sweep_interval);

        tracing::info!(
            pool = config.name.as_deref().unwrap_or("default"),
            min = config.min_size,
            max = config.max_size,
            increment = config.increment,
            "session pool created"
        );

        Ok(pool)
    }

    /// Acquire a session, waiting up to the configured `queue_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        self.acquire_with(AcquireOptions::default()).await
    }

    /// Acquire a session, waiting up to `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<C>, PoolError> {
        self.acquire_with(AcquireOptions::new().timeout(timeout)).await
    }

    /// Acquire a session with explicit options.
    ///
    /// An idle session is preferred (one with a matching tag first). If none
    /// is idle the request joins the FIFO wait queue and, when the pool is
    /// below `max_size`, a growth step is started. Idle sessions unused for
    /// longer than `ping_interval` are pinged first; a failed ping discards
    /// the session and acquisition continues.
    pub async fn acquire_with(
        &self,
        options: AcquireOptions,
    ) -> Result<PooledConnection<C>, PoolError> {
        let span = tracing::debug_span!(span_names::ACQUIRE, tag = options.tag.as_deref());
        let result = self.inner.acquire(options).instrument(span).await;

        if let Err(error) = &result {
            let mut counters = self.inner.counters.lock();
            counters.acquires_failed += 1;
            if matches!(error, PoolError::Timeout { .. }) {
                counters.acquire_timeouts += 1;
            }
        }
        result
    }

    /// Take an idle session without waiting or creating one.
    ///
    /// The session is not pinged.
    pub fn try_acquire(&self) -> Result<Option<PooledConnection<C>>, PoolError> {
        let slot = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            match state.take_idle(None) {
                Some(entry) => {
                    state.busy.insert(entry.slot.conn.id(), SessionState::Busy);
                    entry.slot
                }
                None => return Ok(None),
            }
        };
        let conn = self.inner.checkout(slot, Instant::now());
        self.inner.record_acquired(&conn.metadata);
        Ok(Some(conn))
    }

    /// Return a session to the pool.
    ///
    /// Same as [`PooledConnection::release`].
    pub async fn release(&self, conn: PooledConnection<C>) {
        conn.release().await;
    }

    /// Change the pool bounds.
    ///
    /// Busy sessions are never closed; idle sessions above the new maximum
    /// are pruned by the next sweep. Raising the bounds starts a growth step
    /// when requests are waiting or the pool is below the new minimum.
    pub fn reconfigure(&self, min_size: u32, max_size: u32, increment: u32) -> Result<(), PoolError> {
        {
            let mut state = self.inner.state.lock();
            let config = PoolConfig {
                min_size,
                max_size,
                increment,
                ..state.config.clone()
            };
            config.validate()?;
            state.config = config;
        }
        tracing::info!(min = min_size, max = max_size, increment, "session pool reconfigured");
        self.inner.start_growth();
        Ok(())
    }

    /// Close idle sessions beyond `idle_timeout` (never going below
    /// `min_size`) and idle sessions above `max_size`, oldest first.
    ///
    /// Returns the number of sessions closed. Runs periodically on the
    /// sweeper task.
    pub async fn shrink_pass(&self) -> usize {
        let victims = {
            let mut state = self.inner.state.lock();
            let mut victims = Vec::new();

            let max = state.max_size();
            while state.total() > max {
                match state.idle.pop_front() {
                    Some(entry) => victims.push(entry.slot.conn),
                    None => break,
                }
            }

            if let Some(timeout) = state.config.idle_timeout {
                let min = state.config.min_size as usize;
                while state.total() > min
                    && state
                        .idle
                        .front()
                        .is_some_and(|entry| entry.since.elapsed() > timeout)
                {
                    if let Some(entry) = state.idle.pop_front() {
                        victims.push(entry.slot.conn);
                    }
                }
            }
            victims
        };

        let closed = victims.len();
        if closed > 0 {
            tracing::debug!(closed, "closing idle sessions");
        }
        for conn in victims {
            self.inner.close_session(conn).await;
        }

        self.inner.start_growth();
        self.inner.record_status();
        closed
    }

    /// Close the pool.
    ///
    /// New acquires fail with [`PoolError::PoolClosed`], as do queued ones.
    /// Idle sessions are closed immediately; busy sessions are closed when
    /// released. Waits up to `drain_timeout` for busy sessions and fails
    /// with [`PoolError::CloseTimeout`] if any remain.
    pub async fn close(&self, drain_timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + drain_timeout;
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        self.inner.sweeper.cancel();

        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::PoolClosed));
        }
        for entry in idle {
            self.inner.close_session(entry.slot.conn).await;
        }

        loop {
            let notified = self.inner.drained.notified();
            if self.inner.state.lock().busy.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let busy = self.inner.state.lock().busy.len();
                if busy == 0 {
                    break;
                }
                tracing::warn!(busy, "drain timeout expired with sessions still busy");
                return Err(PoolError::CloseTimeout { busy });
            }
        }

        tracing::info!("session pool closed");
        Ok(())
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config.clone()
    }

    /// Snapshot of occupancy and cumulative counters.
    #[must_use]
    pub fn statistics(&self) -> PoolStatistics {
        let state = self.inner.state.lock();
        let counters = *self.inner.counters.lock();
        PoolStatistics {
            sessions_open: count(state.open()),
            sessions_busy: count(state.busy.len()),
            sessions_idle: count(state.idle.len()),
            sessions_opening: count(state.opening),
            pending_requests: state.waiters.len(),
            max_size: state.config.max_size,
            sessions_created: counters.sessions_created,
            sessions_closed: counters.sessions_closed,
            acquires_successful: counters.acquires_successful,
            acquires_failed: counters.acquires_failed,
            acquire_timeouts: counters.acquire_timeouts,
            pings: counters.pings,
            ping_failures: counters.ping_failures,
            resets: counters.resets,
            reset_failures: counters.reset_failures,
            statement_cache_hits: self.inner.cache_counters.hits(),
            statement_cache_misses: self.inner.cache_counters.misses(),
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Every session the pool tracks, with its state.
    #[must_use]
    pub fn membership(&self) -> Vec<(SessionId, SessionState)> {
        let state = self.inner.state.lock();
        state
            .idle
            .iter()
            .map(|entry| (entry.slot.conn.id(), SessionState::Idle))
            .chain(state.busy.iter().map(|(id, s)| (*id, *s)))
            .collect()
    }

    /// State of one session. Untracked sessions report
    /// [`SessionState::Closed`].
    #[must_use]
    pub fn session_state(&self, id: SessionId) -> SessionState {
        let state = self.inner.state.lock();
        if let Some(s) = state.busy.get(&id) {
            return *s;
        }
        if state.idle.iter().any(|entry| entry.slot.conn.id() == id) {
            SessionState::Idle
        } else {
            SessionState::Closed
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("idle", &state.idle.len())
            .field("busy", &state.busy.len())
            .field("opening", &state.opening)
            .field("waiting", &state.waiters.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PoolInner<C> {
    async fn acquire(self: &Arc<Self>, options: AcquireOptions) -> Result<PooledConnection<C>, PoolError> {
        let started = Instant::now();
        let timeout = match options.timeout {
            Some(timeout) => Some(timeout),
            None => self.state.lock().config.queue_timeout,
        };
        let deadline = timeout.map(|t| started + t);

        loop {
            let step = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }
                if let Some(entry) = state.take_idle(options.tag.as_deref()) {
                    state
                        .busy
                        .insert(entry.slot.conn.id(), SessionState::Validating);
                    Step::Idle(entry.slot)
                } else {
                    // waiters beyond the remaining headroom are the ones queueing
                    let headroom = state.max_size().saturating_sub(state.total());
                    if state.waiters.len() >= headroom + state.config.queue_max {
                        return Err(PoolError::QueueFull {
                            max: state.config.queue_max,
                        });
                    }
                    let id = state.next_request;
                    state.next_request += 1;
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter {
                        id,
                        enqueued_at: Instant::now(),
                        tx,
                    });
                    Step::Queued(id, rx)
                }
            };

            match step {
                Step::Idle(slot) => {
                    let mut conn = self.checkout(slot, started);
                    let interval = self.state.lock().config.ping_interval;
                    if self.ping_if_due(&mut conn, interval).await {
                        self.mark(conn.id(), SessionState::Busy);
                        self.record_acquired(&conn.metadata);
                        return Ok(conn);
                    }
                    if let Some(slot) = conn.slot.take() {
                        self.discard(slot, "ping failed").await;
                    }
                }
                Step::Queued(id, rx) => {
                    tracing::trace!(request = id, "acquire queued");
                    self.start_growth();
                    let guard = WaitGuard {
                        pool: self,
                        id,
                        rx,
                        settled: false,
                    };
                    let slot = guard.wait(started, deadline).await?;
                    let conn = self.checkout(slot, started);
                    self.record_acquired(&conn.metadata);
                    return Ok(conn);
                }
            }
        }
    }

    fn checkout(self: &Arc<Self>, mut slot: Slot<C::Session>, started: Instant) -> PooledConnection<C> {
        slot.checkouts += 1;
        let metadata = SessionMetadata {
            id: slot.conn.id(),
            created_at: slot.conn.created_at(),
            checkouts: slot.checkouts,
            waited: started.elapsed(),
        };
        PooledConnection {
            slot: Some(slot),
            metadata,
            pool: Arc::clone(self),
            from_drop: false,
        }
    }

    fn record_acquired(&self, metadata: &SessionMetadata) {
        self.counters.lock().acquires_successful += 1;
        self.recorder.record_wait(metadata.waited.as_secs_f64());
        self.record_status();
        tracing::trace!(
            session = %metadata.id,
            waited_ms = metadata.waited.as_millis() as u64,
            "session acquired"
        );
    }

    fn mark(&self, id: SessionId, new_state: SessionState) {
        if let Some(s) = self.state.lock().busy.get_mut(&id) {
            *s = new_state;
        }
    }

    fn record_status(&self) {
        let (busy, idle, max, pending) = {
            let state = self.state.lock();
            (
                state.busy.len() as u64,
                state.idle.len() as u64,
                u64::from(state.config.max_size),
                state.waiters.len() as u64,
            )
        };
        self.recorder.record_status(busy, idle, max, pending);
    }

    fn withdraw(&self, request: u64) -> bool {
        self.state.lock().withdraw(request)
    }

    async fn open_session(&self) -> Result<Connection<C::Session>, TransportError> {
        let session = self.connector.connect().await?;
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let cache_size = self.state.lock().config.statement_cache_size;
        self.counters.lock().sessions_created += 1;
        self.recorder.record_created();
        tracing::debug!(session = %id, "session created");
        Ok(Connection::new(
            id,
            session,
            StatementCache::with_counters(cache_size, Arc::clone(&self.cache_counters)),
        ))
    }

    async fn close_session(&self, conn: Connection<C::Session>) {
        let id = conn.id();
        self.counters.lock().sessions_closed += 1;
        if conn.is_broken() {
            tracing::debug!(session = %id, "dropping broken session");
            return;
        }
        match conn.close().await {
            Ok(()) => tracing::debug!(session = %id, "session closed"),
            Err(error) => tracing::debug!(session = %id, error = %error, "error closing session"),
        }
    }

    /// Close a session from a context that cannot await.
    fn close_in_background(self: &Arc<Self>, conn: Connection<C::Session>) {
        let pool = Arc::clone(self);
        self.runtime.spawn(async move { pool.close_session(conn).await });
    }

    /// Ping `conn` if it has been idle for at least `interval`.
    async fn ping_if_due(&self, conn: &mut Connection<C::Session>, interval: Option<Duration>) -> bool {
        let Some(interval) = interval else {
            return true;
        };
        if conn.idle_for() < interval {
            return true;
        }
        self.counters.lock().pings += 1;
        match conn.ping().await {
            Ok(()) => true,
            Err(error) => {
                self.counters.lock().ping_failures += 1;
                tracing::warn!(session = %conn.id(), error = %error, "validation ping failed");
                false
            }
        }
    }

    async fn run_reset(&self, conn: &mut Connection<C::Session>) -> bool {
        let Some(reset) = &self.reset else {
            return true;
        };
        self.counters.lock().resets += 1;
        match reset.reset(conn).await {
            Ok(()) => true,
            Err(error) => {
                self.counters.lock().reset_failures += 1;
                tracing::warn!(session = %conn.id(), error = %error, "session reset failed");
                false
            }
        }
    }

    /// Validate, reset and check a released session back in.
    ///
    /// The slot stays inside `conn` until validation finishes, so dropping
    /// this future hands the session to the guard's own release path.
    async fn release(self: &Arc<Self>, conn: &mut PooledConnection<C>) {
        let Some(slot) = conn.slot.as_mut() else {
            return;
        };
        let id = slot.conn.id();
        let (closed, ping_interval) = {
            let mut state = self.state.lock();
            if let Some(s) = state.busy.get_mut(&id) {
                *s = SessionState::Validating;
            }
            (state.closed, state.config.ping_interval)
        };

        let failure = if closed {
            Some("pool closed")
        } else if slot.conn.is_broken() {
            Some("session broken")
        } else if !self.ping_if_due(&mut slot.conn, ping_interval).await {
            Some("ping failed")
        } else if !self.run_reset(&mut slot.conn).await {
            Some("reset failed")
        } else {
            None
        };

        let Some(slot) = conn.slot.take() else {
            return;
        };
        match failure {
            Some(reason) => self.discard(slot, reason).await,
            None => {
                if let Some(slot) = self.check_in(slot) {
                    self.close_session(slot.conn).await;
                }
            }
        }
    }

    /// Move a busy session back to the pool. Returns it if the pool is
    /// closed.
    fn check_in(&self, slot: Slot<C::Session>) -> Option<Slot<C::Session>> {
        let leftover = {
            let mut state = self.state.lock();
            state.busy.remove(&slot.conn.id());
            state.place(slot)
        };
        self.drained.notify_waiters();
        self.record_status();
        leftover
    }

    /// Drop a busy session from the pool and close it.
    async fn discard(self: &Arc<Self>, slot: Slot<C::Session>, reason: &'static str) {
        let id = slot.conn.id();
        self.state.lock().busy.remove(&id);
        tracing::debug!(session = %id, reason, "discarding session");
        self.drained.notify_waiters();
        self.start_growth();
        self.close_session(slot.conn).await;
    }

    /// Forget a busy session without a close round-trip, then top the pool
    /// back up.
    fn abandon(self: &Arc<Self>, slot: Slot<C::Session>) {
        self.state.lock().busy.remove(&slot.conn.id());
        self.counters.lock().sessions_closed += 1;
        tracing::warn!(session = %slot.conn.id(), "release was dropped, forgetting session");
        self.drained.notify_waiters();
        self.start_growth();
    }

    /// Start a growth step if one is needed and none is running.
    fn start_growth(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.growing || state.growth_needed() == 0 {
                return;
            }
            state.growing = true;
        }
        self.runtime.spawn(Arc::clone(self).grow());
    }

    async fn grow(self: Arc<Self>) {
        loop {
            let batch = {
                let mut state = self.state.lock();
                let need = state.growth_needed();
                if need == 0 {
                    state.growing = false;
                    return;
                }
                state.opening += need;
                need
            };
            tracing::trace!(batch, "growing pool");

            for created in 0..batch {
                match self.open_session().await {
                    Ok(conn) => {
                        let leftover = {
                            let mut state = self.state.lock();
                            state.opening -= 1;
                            state.place(Slot::new(conn))
                        };
                        if let Some(slot) = leftover {
                            self.close_session(slot.conn).await;
                        }
                        self.record_status();
                    }
                    Err(error) => {
                        let (waiter, retry) = {
                            let mut state = self.state.lock();
                            state.opening -= batch - created;
                            let waiter = state.waiters.pop_front();
                            let retry = !state.waiters.is_empty() && !state.closed;
                            if !retry {
                                state.growing = false;
                            }
                            (waiter, retry)
                        };
                        tracing::warn!(error = %error, retry, "failed to create session");
                        if let Some(waiter) = waiter {
                            let _ = waiter.tx.send(Err(PoolError::SessionCreateFailed(error)));
                        }
                        if !retry {
                            return;
                        }
                        // later waiters are still owed a session; back off first
                        tokio::time::sleep(CREATE_RETRY_DELAY).await;
                        break;
                    }
                }
            }
        }
    }
}

fn spawn_sweeper<C: Connector>(inner: &Arc<PoolInner<C>>, every: Duration) {
    let token = inner.sweeper.clone();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    Pool { inner }.shrink_pass().await;
                }
            }
        }
        tracing::trace!("pool sweeper stopped");
    });
}

/// A queued acquire. Dropping it before it settles withdraws the request,
/// or returns the session if the handoff already happened.
struct WaitGuard<'a, C: Connector> {
    pool: &'a Arc<PoolInner<C>>,
    id: u64,
    rx: oneshot::Receiver<Delivery<C::Session>>,
    settled: bool,
}

impl<C: Connector> WaitGuard<'_, C> {
    async fn wait(
        mut self,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<Slot<C::Session>, PoolError> {
        let delivery = match deadline {
            None => (&mut self.rx).await.ok(),
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    if self.pool.withdraw(self.id) {
                        self.settled = true;
                        let waited = started.elapsed();
                        self.pool.recorder.record_timeout();
                        tracing::debug!(
                            request = self.id,
                            waited_ms = waited.as_millis() as u64,
                            "acquire timed out"
                        );
                        return Err(PoolError::Timeout { waited });
                    }
                    // fulfilled as the timer fired
                    self.rx.try_recv().ok()
                }
            },
        };
        self.settled = true;
        delivery.unwrap_or(Err(PoolError::PoolClosed))
    }
}

impl<C: Connector> Drop for WaitGuard<'_, C> {
    fn drop(&mut self) {
        if self.settled || self.pool.withdraw(self.id) {
            return;
        }
        if let Ok(Ok(slot)) = self.rx.try_recv() {
            tracing::trace!(session = %slot.conn.id(), "acquire cancelled after handoff");
            if let Some(slot) = self.pool.check_in(slot) {
                self.pool.close_in_background(slot.conn);
            }
        }
    }
}

/// Builder for a [`Pool`].
pub struct PoolBuilder<C: Connector> {
    connector: C,
    config: PoolConfig,
    reset: Option<DynSessionReset<C::Session>>,
}

impl<C: Connector> PoolBuilder<C> {
    /// Create a builder with default configuration.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            config: PoolConfig::default(),
            reset: None,
        }
    }

    /// Set the whole pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min_size(mut self, count: u32) -> Self {
        self.config.min_size = count;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max_size(mut self, count: u32) -> Self {
        self.config.max_size = count;
        self
    }

    /// Set the growth step.
    #[must_use]
    pub fn increment(mut self, count: u32) -> Self {
        self.config.increment = count;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Set the default acquire timeout.
    #[must_use]
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue_timeout = Some(timeout);
        self
    }

    /// Set the per-session statement cache capacity.
    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.config.statement_cache_size = size;
        self
    }

    /// Run `reset` on every released session before reuse.
    #[must_use]
    pub fn reset(mut self, reset: impl SessionReset<C::Session>) -> Self {
        self.reset = Some(Arc::new(reset));
        self
    }

    /// Build the pool, opening `min_size` sessions.
    pub async fn build(self) -> Result<Pool<C>, PoolError> {
        Pool::create(self.connector, self.config, self.reset).await
    }
}

/// A session checked out of a [`Pool`].
///
/// Derefs to [`Connection`]. Give it back with [`release`](Self::release);
/// dropping it schedules the same release on the current runtime.
pub struct PooledConnection<C: Connector> {
    /// `None` only after the session has been released or detached.
    slot: Option<Slot<C::Session>>,
    metadata: SessionMetadata,
    pool: Arc<PoolInner<C>>,
    from_drop: bool,
}

impl<C: Connector> PooledConnection<C> {
    /// Metadata about this checkout.
    #[must_use]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Validate, reset and return the session to the pool.
    ///
    /// Broken sessions and sessions that fail validation or reset are
    /// closed instead; the pool replaces them if it falls below
    /// `min_size` or requests are waiting.
    pub async fn release(mut self) {
        let pool = Arc::clone(&self.pool);
        let span = tracing::trace_span!(span_names::RELEASE, session = %self.metadata.id);
        pool.release(&mut self).instrument(span).await;
    }

    /// Take the session out of the pool.
    ///
    /// The pool stops accounting for it and may open a replacement.
    pub fn detach(mut self) -> Connection<C::Session> {
        let Some(slot) = self.slot.take() else {
            unreachable!("pooled connection already released");
        };
        self.pool.state.lock().busy.remove(&slot.conn.id());
        self.pool.drained.notify_waiters();
        self.pool.start_growth();
        tracing::debug!(session = %slot.conn.id(), "session detached from pool");
        slot.conn
    }

    fn slot(&self) -> &Slot<C::Session> {
        match &self.slot {
            Some(slot) => slot,
            None => unreachable!("pooled connection already released"),
        }
    }

    fn slot_mut(&mut self) -> &mut Slot<C::Session> {
        match &mut self.slot {
            Some(slot) => slot,
            None => unreachable!("pooled connection already released"),
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = Connection<C::Session>;

    fn deref(&self) -> &Self::Target {
        &self.slot().conn
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot_mut().conn
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        if self.from_drop {
            // the background release itself was dropped
            self.pool.abandon(slot);
            return;
        }
        tracing::trace!(session = %slot.conn.id(), "releasing dropped session");
        let conn = PooledConnection {
            slot: Some(slot),
            metadata: self.metadata.clone(),
            pool: Arc::clone(&self.pool),
            from_drop: true,
        };
        self.pool.runtime.spawn(conn.release());
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
