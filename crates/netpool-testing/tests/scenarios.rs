//! Pool behavior tests against the mock transport.
//!
//! Every test runs on a paused clock, so timeouts and eviction sweeps are
//! deterministic:
//!
//! ```bash
//! cargo test -p netpool-testing --test scenarios
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Poll;
use std::time::Duration;

use netpool::{Connection, ConnectionProvider, DestinationKey, PoolError};
use netpool_testing::MockTransport;
use netpool_testing::fixtures::{self, bounded_provider, settle};
use tokio::sync::mpsc;
use tokio::time::Instant;

const LONG: Duration = Duration::from_secs(45);

fn key(address: &str) -> DestinationKey {
    DestinationKey::new(address)
}

// =============================================================================
// Reuse and bounds
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_bounded_pool_reuses_and_queues() {
    fixtures::init_tracing();
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, LONG);

    let c1 = provider.acquire("db:1").await.unwrap();
    let c2 = provider.acquire("db:1").await.unwrap();
    assert_ne!(c1.id(), c2.id());

    let reused_id = c1.id();
    drop(c1);
    let c3 = provider.acquire("db:1").await.unwrap();
    assert_eq!(c3.id(), reused_id);
    assert_eq!(transport.connects(), 2);

    // at capacity: the next acquisition queues
    let queued = tokio::spawn(provider.acquire("db:1"));
    settle().await;
    let status = provider.status(&key("db:1")).unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.in_use, 2);

    let handed_id = c2.id();
    drop(c2);
    let c4 = queued.await.unwrap().unwrap();
    assert_eq!(c4.id(), handed_id);
    assert_eq!(transport.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_never_wait_fails_fast() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, netpool::ACQUIRE_TIMEOUT_NEVER_WAIT);

    let held = provider.acquire("db:1").await.unwrap();
    let started = Instant::now();
    let err = provider.acquire("db:1").await.unwrap_err();

    assert!(matches!(err, PoolError::PoolExhausted { max: 1 }));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 0);

    drop(held);
    assert!(provider.acquire("db:1").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_queued_acquisition_times_out() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, Duration::from_millis(500));

    let _held = provider.acquire("db:1").await.unwrap();
    let started = Instant::now();
    let err = provider.acquire("db:1").await.unwrap_err();

    assert!(matches!(err, PoolError::AcquisitionTimeout(d) if d == Duration::from_millis(500)));
    assert_eq!(started.elapsed(), Duration::from_millis(500));
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_waiter_is_skipped_on_release() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, Duration::from_millis(100));

    let held = provider.acquire("db:1").await.unwrap();
    let mut first = tokio_test::task::spawn(provider.acquire("db:1"));
    assert!(first.poll().is_pending());

    tokio::time::advance(Duration::from_millis(50)).await;
    let mut second = tokio_test::task::spawn(provider.acquire("db:1"));
    assert!(second.poll().is_pending());
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 2);

    // the first deadline has passed, but its waiter has not run since
    tokio::time::advance(Duration::from_millis(60)).await;
    let handed_id = held.id();
    drop(held);

    let err = match first.poll() {
        Poll::Ready(result) => result.unwrap_err(),
        Poll::Pending => panic!("expired waiter still pending"),
    };
    assert!(matches!(err, PoolError::AcquisitionTimeout(d) if d == Duration::from_millis(100)));

    let conn = match second.poll() {
        Poll::Ready(result) => result.unwrap(),
        Poll::Pending => panic!("live waiter not served"),
    };
    assert_eq!(conn.id(), handed_id);
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 0);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_queue_limit() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("bounded-queue")
        .max_connections(1)
        .unwrap()
        .max_pending_acquire(2)
        .unwrap()
        .acquire_timeout(Duration::from_secs(10))
        .build(transport.clone());

    let _held = provider.acquire("db:1").await.unwrap();
    let _w1 = tokio::spawn(provider.acquire("db:1"));
    let _w2 = tokio::spawn(provider.acquire("db:1"));
    settle().await;

    let err = provider.acquire("db:1").await.unwrap_err();
    assert!(matches!(err, PoolError::TooManyPending { max: 2 }));
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 2);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, Duration::from_secs(10));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let held = provider.acquire("db:1").await.unwrap();
    for index in 0..4 {
        let provider = provider.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let conn = provider.acquire("db:1").await.unwrap();
            tx.send(index).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(conn);
        });
        // fix the arrival order
        settle().await;
    }
    drop(tx);
    drop(held);

    let mut order = Vec::new();
    while let Some(index) = rx.recv().await {
        order.push(index);
    }
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_elastic_pool_never_queues() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("elastic")
        .max_connections(netpool::MAX_CONNECTIONS_ELASTIC)
        .unwrap()
        .build(transport.clone());

    let mut held = Vec::new();
    for _ in 0..50 {
        held.push(provider.acquire("db:1").await.unwrap());
    }

    assert_eq!(transport.connects(), 50);
    assert!(provider.max_connections().is_unbounded());
    let status = provider.status(&key("db:1")).unwrap();
    assert_eq!(status.in_use, 50);
    assert_eq!(status.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn test_bound_holds_under_contention() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 3, Duration::from_secs(60));
    let held = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20u64)
        .map(|i| {
            let provider = provider.clone();
            let held = Arc::clone(&held);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let conn = provider.acquire("db:1").await.unwrap();
                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5 + i % 7)).await;
                held.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(transport.connects(), 3);
    assert!(transport.peak_open_connections() <= 3);
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_connection_evicted_by_sweep() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("idle")
        .max_connections(2)
        .unwrap()
        .max_idle_time(Duration::from_secs(1))
        .build(transport.clone());

    drop(provider.acquire("db:1").await.unwrap());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    // idle past the limit but no sweep has seen it yet
    assert_eq!(provider.status(&key("db:1")).unwrap().available, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = provider.status(&key("db:1")).unwrap();
    assert_eq!(status.available, 0);
    assert_eq!(status.total, 0);
    assert_eq!(transport.closes(), 1);

    let fresh = provider.acquire("db:1").await.unwrap();
    assert_eq!(fresh.id(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_expired_connection_skipped_on_acquire() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("idle")
        .max_connections(2)
        .unwrap()
        .max_idle_time(Duration::from_secs(1))
        .eviction_interval(Duration::from_secs(60))
        .build(transport.clone());

    drop(provider.acquire("db:1").await.unwrap());
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let conn = provider.acquire("db:1").await.unwrap();
    assert_eq!(conn.id(), 2);
    settle().await;
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_life_time_evicts_busy_connection() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("life")
        .max_connections(2)
        .unwrap()
        .max_life_time(Duration::from_secs(2))
        .eviction_interval(Duration::from_millis(100))
        .build(transport.clone());

    // used every 300ms, never idle for long
    let mut ids = Vec::new();
    for _ in 0..6 {
        let conn = provider.acquire("db:1").await.unwrap();
        ids.push(conn.id());
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(conn);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let conn = provider.acquire("db:1").await.unwrap();
    ids.push(conn.id());
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(conn);

    assert!(ids.iter().all(|&id| id == 1));
    assert_eq!(provider.status(&key("db:1")).unwrap().available, 1);

    // age passes 2s at the sweep after t=2.0
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.status(&key("db:1")).unwrap().total, 0);
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_connection_closed_on_release() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("life")
        .max_connections(1)
        .unwrap()
        .max_life_time(Duration::from_secs(1))
        .eviction_interval(Duration::from_secs(60))
        .build(transport.clone());

    let conn = provider.acquire("db:1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    drop(conn);
    settle().await;

    assert_eq!(provider.status(&key("db:1")).unwrap().total, 0);
    assert_eq!(transport.closes(), 1);
}

// =============================================================================
// Health and failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_broken_connection_replaced_for_waiter() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, Duration::from_secs(5));

    let held = provider.acquire("db:1").await.unwrap();
    let waiter = tokio::spawn(provider.acquire("db:1"));
    settle().await;

    held.break_connection();
    drop(held);

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), 2);
    settle().await;
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_affects_only_its_caller() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, Duration::from_secs(5));

    transport.fail_next(1);
    let err = provider.acquire("db:1").await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionCreation(_)));
    assert_eq!(provider.status(&key("db:1")).unwrap().total, 0);

    assert!(provider.acquire("db:1").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_failed_creation_for_queue_fails_oldest_waiter_only() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, Duration::from_secs(5));

    let held = provider.acquire("db:1").await.unwrap();
    let first = tokio::spawn(provider.acquire("db:1"));
    settle().await;
    let second = tokio::spawn(provider.acquire("db:1"));
    settle().await;

    transport.fail_next(1);
    held.break_connection();
    drop(held);

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, PoolError::ConnectionCreation(_)));
    let conn = second.await.unwrap().unwrap();
    assert_eq!(conn.id(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refused_destination_does_not_affect_others() {
    let transport = MockTransport::builder().refuse("down:1").build();
    let provider = bounded_provider(&transport, 2, Duration::from_secs(5));

    assert!(provider.acquire("down:1").await.is_err());
    assert!(provider.acquire("up:1").await.is_ok());
    assert_eq!(transport.connects_to("up:1"), 1);
    assert_eq!(transport.connects_to("down:1"), 0);
}

// =============================================================================
// Laziness and cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_acquire_is_lazy() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, LONG);

    let acquire = provider.acquire("db:1");
    settle().await;
    assert_eq!(transport.connect_attempts(), 0);
    assert!(provider.status(&key("db:1")).is_none());
    drop(acquire);
    assert_eq!(transport.connect_attempts(), 0);

    let acquire = provider.acquire("db:1");
    let conn = acquire.await.unwrap();
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(conn.destination().address(), "db:1");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_is_removed() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, Duration::from_secs(5));

    let held = provider.acquire("db:1").await.unwrap();
    let mut waiting = tokio_test::task::spawn(provider.acquire("db:1"));
    assert!(waiting.poll().is_pending());
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 1);

    drop(waiting);
    assert_eq!(provider.status(&key("db:1")).unwrap().pending, 0);

    drop(held);
    let status = provider.status(&key("db:1")).unwrap();
    assert_eq!(status.available, 1);
    assert_eq!(status.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_releases_slot() {
    let transport = MockTransport::builder()
        .connect_latency(Duration::from_secs(1))
        .build();
    let provider = bounded_provider(&transport, 1, Duration::from_secs(5));

    let connecting = tokio::spawn(provider.acquire("db:1"));
    settle().await;
    assert_eq!(provider.status(&key("db:1")).unwrap().total, 1);

    connecting.abort();
    assert!(connecting.await.unwrap_err().is_cancelled());
    assert_eq!(provider.status(&key("db:1")).unwrap().total, 0);

    let conn = provider.acquire("db:1").await.unwrap();
    assert!(conn.is_healthy());
}

// =============================================================================
// Disposal
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispose_when_targets_one_destination() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, LONG);

    drop(provider.acquire("a:1").await.unwrap());
    drop(provider.acquire("b:1").await.unwrap());

    provider.dispose_when(&key("a:1")).await;

    assert!(provider.status(&key("a:1")).is_none());
    assert_eq!(provider.status(&key("b:1")).unwrap().available, 1);
    assert_eq!(transport.closes(), 1);
    assert!(!provider.is_disposed());

    // a fresh pool on next use
    let conn = provider.acquire("a:1").await.unwrap();
    assert_eq!(transport.connects_to("a:1"), 2);
    assert_eq!(conn.metadata().acquire_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_when_fails_queued_acquisitions() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, LONG);

    let held = provider.acquire("a:1").await.unwrap();
    let waiter = tokio::spawn(provider.acquire("a:1"));
    settle().await;

    let disposal = tokio::spawn(provider.dispose_when(&key("a:1")));
    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_closed());

    // the held connection keeps the pool registered and the disposal pending
    settle().await;
    assert!(!disposal.is_finished());
    assert_eq!(provider.pool_count(), 1);

    drop(held);
    disposal.await.unwrap();
    assert_eq!(transport.closes(), 1);
    assert_eq!(transport.open_connections(), 0);
    assert_eq!(provider.pool_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_later_waits_for_held_connection() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, LONG);

    let held = provider.acquire("a:1").await.unwrap();
    let disposal = tokio::spawn(provider.dispose_later());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(!disposal.is_finished());
    assert!(provider.is_disposed());
    assert_eq!(provider.pool_count(), 1);
    assert_eq!(transport.closes(), 0);

    drop(held);
    disposal.await.unwrap();
    assert_eq!(transport.open_connections(), 0);
    assert_eq!(transport.closes(), 1);
    assert_eq!(provider.pool_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_later_waits_for_connect_in_flight() {
    let transport = MockTransport::builder()
        .connect_latency(Duration::from_secs(1))
        .build();
    let provider = bounded_provider(&transport, 2, LONG);

    let connecting = tokio::spawn(provider.acquire("a:1"));
    settle().await;
    assert_eq!(transport.connect_attempts(), 1);

    provider.dispose_later().await;
    // the connection opened after shutdown began was closed before completion
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.closes(), 1);
    assert_eq!(transport.open_connections(), 0);
    assert_eq!(provider.pool_count(), 0);

    assert!(connecting.await.unwrap().unwrap_err().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_later_is_cold_and_idempotent() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, LONG);

    drop(provider.acquire("a:1").await.unwrap());
    drop(provider.acquire("b:1").await.unwrap());

    let first = provider.dispose_later();
    let second = provider.dispose_later();
    settle().await;
    assert!(!provider.is_disposed());
    assert_eq!(transport.closes(), 0);

    futures_util::future::join(first, second).await;
    provider.dispose_later().await;

    assert!(provider.is_disposed());
    assert_eq!(provider.pool_count(), 0);
    assert_eq!(transport.closes(), 2);
    assert!(provider.acquire("a:1").await.unwrap_err().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_is_fire_and_forget() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 2, LONG);
    drop(provider.acquire("a:1").await.unwrap());

    provider.dispose();
    assert!(provider.is_disposed());
    assert!(provider.acquire("a:1").await.unwrap_err().is_closed());

    settle().await;
    assert_eq!(transport.closes(), 1);
    assert_eq!(provider.pool_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_waits_for_release() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("grace")
        .max_connections(2)
        .unwrap()
        .dispose_grace_period(Duration::from_secs(5))
        .build(transport.clone());

    let held = provider.acquire("a:1").await.unwrap();
    let disposal = tokio::spawn(provider.dispose_later());
    settle().await;
    assert!(!disposal.is_finished());

    drop(held);
    disposal.await.unwrap();
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expires() {
    let transport = MockTransport::new();
    let provider = fixtures::builder("grace")
        .max_connections(2)
        .unwrap()
        .dispose_grace_period(Duration::from_secs(5))
        .build(transport.clone());

    let held = provider.acquire("a:1").await.unwrap();
    let started = Instant::now();
    provider.dispose_later().await;
    assert_eq!(started.elapsed(), Duration::from_secs(5));

    // still closed once it comes back
    drop(held);
    settle().await;
    assert_eq!(transport.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_still_waits_for_connect_in_flight() {
    let transport = MockTransport::builder()
        .connect_latency(Duration::from_secs(1))
        .build();
    let provider = fixtures::builder("grace")
        .max_connections(2)
        .unwrap()
        .dispose_grace_period(Duration::from_millis(100))
        .build(transport.clone());

    let started = Instant::now();
    let connecting = tokio::spawn(provider.acquire("a:1"));
    settle().await;

    provider.dispose_later().await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.closes(), 1);
    assert_eq!(transport.open_connections(), 0);

    assert!(connecting.await.unwrap().unwrap_err().is_closed());
}

// =============================================================================
// Always-create provider
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_new_connection_provider() {
    let transport = MockTransport::new();
    let provider = ConnectionProvider::new_connection(transport.clone());

    let a = provider.acquire("db:1").await.unwrap();
    let b = provider.acquire("db:1").await.unwrap();
    assert_ne!(a.id(), b.id());
    drop(a);
    drop(b);
    settle().await;

    assert_eq!(transport.connects(), 2);
    assert_eq!(transport.closes(), 2);
    assert!(provider.status(&key("db:1")).is_none());

    provider.dispose_later().await;
    assert!(!provider.is_disposed());
    assert!(provider.acquire("db:1").await.is_ok());
}

// =============================================================================
// Keys
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transport_config_separates_pools() {
    let transport = MockTransport::new();
    let provider = bounded_provider(&transport, 1, netpool::ACQUIRE_TIMEOUT_NEVER_WAIT);

    let plain = key("api:443");
    let tls = key("api:443").with_transport_config(&("tls", true));

    let _a = provider.acquire(plain.clone()).await.unwrap();
    let _b = provider.acquire(tls.clone()).await.unwrap();

    assert_eq!(provider.pool_count(), 2);
    assert_eq!(transport.connects_to("api:443"), 2);
}
