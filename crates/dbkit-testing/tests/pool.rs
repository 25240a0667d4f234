//! Pool behavior against the in-memory wire session.
//!
//! All tests run on a paused clock, so timeouts and idle expiry are exact.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::time::Duration;

use dbkit_client::{Connection, ExecuteOptions, TransportError};
use dbkit_pool::{AcquireOptions, Pool, PoolError, RollbackReset, SessionState};
use dbkit_testing::{MockConnector, MockDatabase, MockSession, init_tracing, pool_config};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

/// Let spawned release and growth tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn assert_exclusive(pool: &Pool<MockConnector>) {
    let members = pool.membership();
    let ids: HashSet<_> = members.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids.len(), members.len(), "session tracked twice: {members:?}");
}

async fn wait_for_pending(pool: &Pool<MockConnector>, pending: usize) {
    while pool.statistics().pending_requests < pending {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Sizing and membership
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_opens_min_sessions_on_build() {
    init_tracing();
    let db = MockDatabase::new();
    let pool = assert_ok!(Pool::new(db.connector(), pool_config(3, 5)).await);

    let stats = pool.statistics();
    assert_eq!(db.counts().connects, 3);
    assert_eq!(stats.sessions_idle, 3);
    assert_eq!(stats.sessions_busy, 0);
    assert_eq!(stats.sessions_created, 3);
}

#[tokio::test(start_paused = true)]
async fn test_build_fails_when_initial_sessions_fail() {
    let db = MockDatabase::new();
    db.fail_next_connects(1);
    let err = assert_err!(Pool::new(db.connector(), pool_config(2, 4)).await);
    assert!(matches!(err, PoolError::SessionCreateFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_session_is_idle_or_busy_never_both() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(2, 4)).await.unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    assert_exclusive(&pool);
    assert_eq!(pool.session_state(a.id()), SessionState::Busy);

    let a_id = a.id();
    a.release().await;
    assert_exclusive(&pool);
    assert_eq!(pool.session_state(a_id), SessionState::Idle);

    let stats = pool.statistics();
    assert_eq!(stats.sessions_open, 3);
    assert_eq!(stats.sessions_busy, 2);
    assert_eq!(stats.sessions_idle, 1);

    b.release().await;
    c.release().await;
    assert_exclusive(&pool);
    assert!(
        pool.membership()
            .iter()
            .all(|(_, state)| *state == SessionState::Idle)
    );
}

#[tokio::test(start_paused = true)]
async fn test_never_exceeds_max() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(0, 2)).await.unwrap();

    let _a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    let err = assert_err!(pool.acquire_timeout(Duration::from_millis(50)).await);
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert_eq!(db.counts().connects, 2);
    assert!(pool.statistics().is_at_capacity());
}

#[tokio::test(start_paused = true)]
async fn test_try_acquire_does_not_wait() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    let conn = assert_ok!(pool.try_acquire()).expect("idle session");
    assert!(assert_ok!(pool.try_acquire()).is_none());
    conn.release().await;

    pool.close(Duration::ZERO).await.unwrap();
    assert!(matches!(pool.try_acquire(), Err(PoolError::PoolClosed)));
}

// =============================================================================
// Wait queue
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();
    let held = pool.acquire().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut tasks = Vec::new();
    for i in 0..3usize {
        let waiter_pool = pool.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let conn = waiter_pool.acquire().await.unwrap();
            tx.send(i).unwrap();
            conn.release().await;
        }));
        wait_for_pending(&pool, i + 1).await;
    }

    held.release().await;
    for task in tasks {
        task.await.unwrap();
    }

    let order: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap()).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(pool.statistics().pending_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out_and_leaves_no_request_behind() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();
    let _held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let err = assert_err!(pool.acquire_timeout(Duration::from_millis(100)).await);
    let elapsed = started.elapsed();

    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(err.is_recoverable());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));

    let stats = pool.statistics();
    assert_eq!(stats.pending_requests, 0);
    assert_eq!(stats.acquire_timeouts, 1);
    assert_eq!(stats.acquires_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_withdraws_request() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();
    let held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id()) });
    wait_for_pending(&pool, 1).await;

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(pool.statistics().pending_requests, 0);

    // the session goes back to idle instead of to the abandoned request
    held.release().await;
    assert_eq!(pool.statistics().sessions_idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_max_bounds_waiters() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1).queue_max(0))
        .await
        .unwrap();
    let _held = pool.acquire().await.unwrap();

    let err = assert_err!(pool.acquire().await);
    assert!(matches!(err, PoolError::QueueFull { max: 0 }));
}

#[tokio::test(start_paused = true)]
async fn test_queue_max_counts_burst_on_empty_pool() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(0, 1).queue_max(0))
        .await
        .unwrap();

    // neither request finds a session; only one can be covered by growth
    let (first, second) = tokio::join!(pool.acquire(), pool.acquire());
    let conn = assert_ok!(first);
    let err = assert_err!(second);
    assert!(matches!(err, PoolError::QueueFull { max: 0 }));
    assert_eq!(db.counts().connects, 1);
    conn.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_creation_failure_fails_oldest_waiter() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(0, 2)).await.unwrap();
    db.fail_next_connects(1);

    let err = assert_err!(pool.acquire().await);
    assert!(matches!(err, PoolError::SessionCreateFailed(_)));

    // the next acquire retries creation
    let conn = assert_ok!(pool.acquire().await);
    assert_eq!(db.counts().connect_failures, 1);
    assert_eq!(db.counts().connects, 1);
    conn.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_creation_failure_still_serves_later_waiters() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(0, 1)).await.unwrap();
    db.set_connect_delay(Duration::from_millis(10));
    db.fail_next_connects(1);

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_pending(&pool, 1).await;
    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|conn| conn.id()) }
    });
    wait_for_pending(&pool, 2).await;

    let started = Instant::now();
    let err = assert_err!(first.await.unwrap());
    assert!(matches!(err, PoolError::SessionCreateFailed(_)));
    assert_ok!(second.await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(db.counts().connect_failures, 1);
    assert_eq!(db.counts().connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_growth_is_bounded_by_increment() {
    let db = MockDatabase::new();
    let config = pool_config(0, 10).increment(3);
    let pool = Pool::new(db.connector(), config).await.unwrap();

    let conn = pool.acquire().await.unwrap();
    settle().await;

    // one waiter needs one session
    assert_eq!(db.counts().connects, 1);
    assert!(pool.statistics().sessions_open <= 3);
    conn.release().await;
}

// =============================================================================
// Release path: validation and reset
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reset_runs_on_release() {
    let db = MockDatabase::new();
    let pool = Pool::builder(db.connector())
        .config(pool_config(1, 1))
        .reset(RollbackReset)
        .build()
        .await
        .unwrap();

    let mut conn = pool.acquire().await.unwrap();
    conn.set_tag(Some("schema=hr".into()));
    conn.release().await;

    assert_eq!(db.counts().rollbacks, 1);
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.tag(), None);
    assert_eq!(pool.statistics().resets, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_completes_before_handoff_to_waiter() {
    let db = MockDatabase::new();
    let pool = Pool::builder(db.connector())
        .config(pool_config(1, 1))
        .reset(RollbackReset)
        .build()
        .await
        .unwrap();

    let mut held = pool.acquire().await.unwrap();
    held.set_tag(Some("dirty".into()));

    let waiter_pool = pool.clone();
    let probe = db.clone();
    let waiter = tokio::spawn(async move {
        let conn = waiter_pool.acquire().await.unwrap();
        (conn.tag().map(str::to_string), probe.counts().rollbacks)
    });
    wait_for_pending(&pool, 1).await;

    held.release().await;
    let (tag, rollbacks) = waiter.await.unwrap();
    assert_eq!(tag, None);
    assert_eq!(rollbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reset_discards_and_replaces() {
    let db = MockDatabase::new();
    let pool = Pool::builder(db.connector())
        .config(pool_config(1, 2))
        .reset(|_conn: &mut Connection<MockSession>| -> dbkit_client::Result<()> {
            Err(dbkit_client::Error::Config("session state is dirty".into()))
        })
        .build()
        .await
        .unwrap();

    let conn = pool.acquire().await.unwrap();
    let first = conn.id();
    conn.release().await;

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), first);

    let stats = pool.statistics();
    assert_eq!(stats.reset_failures, 1);
    assert_eq!(stats.sessions_created, 2);
    assert_eq!(stats.sessions_closed, 1);
    assert_eq!(db.counts().session_closes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ping_on_acquire_discards_session() {
    let db = MockDatabase::new();
    let config = pool_config(1, 2).ping_interval(Duration::ZERO);
    let pool = Pool::new(db.connector(), config).await.unwrap();
    let first = pool.membership()[0].0;

    db.fail_pings(true);
    let conn = assert_ok!(pool.acquire().await);
    assert_ne!(conn.id(), first);

    let stats = pool.statistics();
    assert_eq!(stats.pings, 1);
    assert_eq!(stats.ping_failures, 1);
    assert_eq!(pool.session_state(first), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_ping_only_after_interval() {
    let db = MockDatabase::new();
    let config = pool_config(1, 1).ping_interval(Duration::from_secs(60));
    let pool = Pool::new(db.connector(), config).await.unwrap();

    pool.acquire().await.unwrap().release().await;
    assert_eq!(db.counts().pings, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    pool.acquire().await.unwrap().release().await;
    assert_eq!(db.counts().pings, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ping_on_release_discards_and_replaces() {
    let db = MockDatabase::new();
    let config = pool_config(1, 2).ping_interval(Duration::from_secs(60));
    let pool = Pool::new(db.connector(), config).await.unwrap();

    let conn = pool.acquire().await.unwrap();
    let first = conn.id();
    assert_eq!(db.counts().pings, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    db.fail_pings(true);
    conn.release().await;
    settle().await;

    let stats = pool.statistics();
    assert_eq!(stats.pings, 1);
    assert_eq!(stats.ping_failures, 1);
    assert_eq!(pool.session_state(first), SessionState::Closed);
    assert_eq!(stats.sessions_created, 2);
    assert_eq!(stats.sessions_idle, 1);
    assert!(pool.membership().iter().all(|(id, _)| *id != first));
}

#[tokio::test(start_paused = true)]
async fn test_broken_session_is_discarded_on_release() {
    let db = MockDatabase::new();
    db.add_dml("DELETE FROM jobs", 0, 3);
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    db.fail_next_execute(TransportError::ConnectionClosed);
    let err = assert_err!(conn.execute("DELETE FROM jobs", &[], &ExecuteOptions::default()).await);
    assert!(matches!(err, dbkit_client::Error::Transport { operation: "execute", .. }));
    assert!(conn.is_broken());
    conn.release().await;

    let mut conn = pool.acquire().await.unwrap();
    let affected = conn
        .execute("DELETE FROM jobs", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(pool.statistics().sessions_closed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_tagged_acquire_prefers_matching_session() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(2, 2)).await.unwrap();

    let mut a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    a.set_tag(Some("NLS_DATE_FORMAT=ISO".into()));
    a.release().await;
    b.release().await;

    let tagged = pool
        .acquire_with(AcquireOptions::new().tag("NLS_DATE_FORMAT=ISO"))
        .await
        .unwrap();
    assert_eq!(tagged.id(), a_id);

    let untagged = pool
        .acquire_with(AcquireOptions::new().tag("missing"))
        .await
        .unwrap();
    assert_eq!(untagged.id(), b_id);
}

// =============================================================================
// Guards
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dropped_guard_returns_session() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    drop(pool.acquire().await.unwrap());
    settle().await;

    let stats = pool.statistics();
    assert_eq!(stats.sessions_idle, 1);
    assert_eq!(stats.sessions_busy, 0);
}

#[tokio::test(start_paused = true)]
async fn test_guard_dropped_off_runtime_returns_session() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    std::thread::spawn(move || drop(conn)).join().unwrap();
    settle().await;

    let stats = pool.statistics();
    assert_eq!(stats.sessions_idle, 1);
    assert_eq!(stats.sessions_busy, 0);
    assert_eq!(stats.sessions_closed, 0);
    assert_eq!(pool.session_state(id), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_detach_removes_session_and_replenishes() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    let conn = pool.acquire().await.unwrap();
    let raw = conn.detach();
    assert_eq!(pool.session_state(raw.id()), SessionState::Closed);

    settle().await;
    let stats = pool.statistics();
    assert_eq!(stats.sessions_idle, 1);
    assert_eq!(db.counts().connects, 2);

    raw.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_metadata_counts_checkouts() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    pool.acquire().await.unwrap().release().await;
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.metadata().checkouts, 2);
    assert_eq!(conn.metadata().id, conn.id());
}

// =============================================================================
// Shrinking and reconfiguration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shrink_closes_expired_idle_down_to_min() {
    let db = MockDatabase::new();
    let config = pool_config(1, 3).idle_timeout(Duration::from_secs(60));
    let pool = Pool::new(db.connector(), config).await.unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    a.release().await;
    b.release().await;
    c.release().await;

    assert_eq!(pool.shrink_pass().await, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(pool.shrink_pass().await, 2);
    assert_eq!(pool.statistics().sessions_open, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_grows_for_waiters() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();
    let _held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id()) });
    wait_for_pending(&pool, 1).await;

    pool.reconfigure(1, 2, 1).unwrap();
    assert!(waiter.await.unwrap().is_ok());
    assert_eq!(db.counts().connects, 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_shrink_prunes_idle_at_next_sweep() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(0, 2)).await.unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    a.release().await;
    b.release().await;

    pool.reconfigure(0, 1, 1).unwrap();
    assert_eq!(pool.statistics().sessions_open, 2);

    assert_eq!(pool.shrink_pass().await, 1);
    assert_eq!(pool.statistics().sessions_open, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_rejects_invalid_bounds() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 2)).await.unwrap();
    assert!(matches!(
        pool.reconfigure(3, 2, 1),
        Err(PoolError::Config(_))
    ));
    assert_eq!(pool.config().max_size, 2);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_with_busy_session_times_out() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 2)).await.unwrap();
    let busy = pool.acquire().await.unwrap();

    let err = assert_err!(pool.close(Duration::ZERO).await);
    assert!(matches!(err, PoolError::CloseTimeout { busy: 1 }));
    assert!(pool.is_closed());
    assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));

    // released after close: closed, not pooled
    busy.release().await;
    assert_eq!(db.counts().session_closes, 1);
    assert!(pool.membership().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_drains_busy_sessions() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(2, 2)).await.unwrap();
    let busy = pool.acquire().await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        busy.release().await;
    });

    assert_ok!(pool.close(Duration::from_secs(5)).await);
    assert_eq!(db.counts().session_closes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_fails_queued_requests() {
    let db = MockDatabase::new();
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();
    let _held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id()) });
    wait_for_pending(&pool, 1).await;

    let _ = pool.close(Duration::ZERO).await;
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::PoolClosed)));
}

// =============================================================================
// Statistics
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_statistics_include_statement_cache() {
    let db = MockDatabase::new();
    db.add_numbers("SELECT n FROM t", 3);
    let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    for _ in 0..3 {
        let rows = conn
            .query("SELECT n FROM t", &[], &ExecuteOptions::default())
            .await
            .unwrap()
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }
    conn.release().await;

    let stats = pool.statistics();
    assert_eq!(stats.statement_cache_misses, 1);
    assert_eq!(stats.statement_cache_hits, 2);
    assert_eq!(stats.acquires_successful, 1);
    assert_eq!(db.counts().prepares, 1);
}

// =============================================================================
// Properties
// =============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Acquire,
        Release,
        Drop,
        Shrink,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Acquire),
            2 => Just(Op::Release),
            1 => Just(Op::Drop),
            1 => Just(Op::Shrink),
        ]
    }

    proptest! {
        #[test]
        fn prop_membership_is_exclusive_and_bounded(
            ops in proptest::collection::vec(op(), 1..40),
            min in 0u32..3,
            extra in 0u32..3,
        ) {
            let max = min + extra + 1;
            runtime().block_on(async move {
                let db = MockDatabase::new();
                let pool = Pool::new(db.connector(), pool_config(min, max)).await.unwrap();
                let mut held = Vec::new();

                for op in ops {
                    match op {
                        Op::Acquire if held.len() < max as usize => {
                            held.push(pool.acquire().await.unwrap());
                        }
                        Op::Acquire => {
                            assert!(pool.try_acquire().unwrap().is_none());
                        }
                        Op::Release => {
                            if let Some(conn) = held.pop() {
                                conn.release().await;
                            }
                        }
                        Op::Drop => {
                            if !held.is_empty() {
                                drop(held.remove(0));
                            }
                        }
                        Op::Shrink => {
                            pool.shrink_pass().await;
                        }
                    }
                    settle().await;

                    assert_exclusive(&pool);
                    let stats = pool.statistics();
                    assert!(stats.sessions_open <= max);
                    assert_eq!(stats.sessions_busy as usize, held.len());
                    for conn in &held {
                        assert_eq!(pool.session_state(conn.id()), SessionState::Busy);
                    }
                }
            });
        }

        #[test]
        fn prop_waiters_served_fifo(waiters in 1usize..8) {
            runtime().block_on(async move {
                let db = MockDatabase::new();
                let pool = Pool::new(db.connector(), pool_config(1, 1)).await.unwrap();
                let held = pool.acquire().await.unwrap();

                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                let mut tasks = Vec::new();
                for i in 0..waiters {
                    let waiter_pool = pool.clone();
                    let tx = tx.clone();
                    tasks.push(tokio::spawn(async move {
                        let conn = waiter_pool.acquire().await.unwrap();
                        tx.send(i).unwrap();
                        conn.release().await;
                    }));
                    wait_for_pending(&pool, i + 1).await;
                }

                held.release().await;
                for task in tasks {
                    task.await.unwrap();
                }
                let order: Vec<_> = (0..waiters).map(|_| rx.try_recv().unwrap()).collect();
                assert_eq!(order, (0..waiters).collect::<Vec<_>>());
            });
        }
    }
}
