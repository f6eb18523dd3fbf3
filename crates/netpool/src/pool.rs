//! Per-destination connection pool.
//!
//! Every destination gets its own [`Pool`], which owns the idle connections,
//! the count of allocated slots, and the FIFO queue of acquisitions waiting
//! for a slot. All transitions on that state happen under one lock, which is
//! never held across an `.await`: claiming an idle entry, reserving a slot for
//! a new connection, queueing or dequeueing a waiter, and evicting entries are
//! therefore mutually exclusive.
//!
//! ```text
//! acquire ──► idle entry usable? ──yes──► Acquired
//!                 │no
//!                 ▼
//!            slot free? ──yes──► Transport::connect ──► Acquired
//!                 │no
//!                 ▼
//!            never wait? ──yes──► PoolExhausted
//!                 │no
//!                 ▼
//!            queue full? ──yes──► TooManyPending
//!                 │no
//!                 ▼
//!            wait (FIFO) ──► handed off on release, or AcquisitionTimeout
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{Limit, PoolConfig};
use crate::connection::PooledConnection;
use crate::error::{PoolError, Result};
use crate::evict;
use crate::key::DestinationKey;
use crate::lifecycle::{Connection, PoolEntry, Transport};

/// Deadline used when `now + acquire_timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

type EntryResult<C> = Result<PoolEntry<C>>;

/// A queued acquisition.
struct PendingRequest<C> {
    id: u64,
    enqueued_at: Instant,
    deadline: Instant,
    tx: oneshot::Sender<EntryResult<C>>,
}

struct PoolState<C> {
    idle: VecDeque<PoolEntry<C>>,
    pending: VecDeque<PendingRequest<C>>,
    /// Idle + in use + connections being opened.
    allocated: usize,
    in_use: usize,
    /// Connections handed to `Transport::close` that have not finished closing.
    closing: usize,
    closed: bool,
    next_connection_id: u64,
    next_request_id: u64,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            pending: VecDeque::new(),
            allocated: 0,
            in_use: 0,
            closing: 0,
            closed: false,
            next_connection_id: 1,
            next_request_id: 1,
        }
    }

    fn connection_id(&mut self) -> u64 {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Give up an allocated slot whose connection is about to be closed.
    fn retire(&mut self, mut entry: PoolEntry<C>, to_close: &mut Vec<PoolEntry<C>>) {
        entry.meta.mark_closed();
        self.allocated -= 1;
        self.closing += 1;
        to_close.push(entry);
    }

    /// Slots reserved for connections that are still being opened.
    fn connecting(&self) -> usize {
        self.allocated.saturating_sub(self.idle.len() + self.in_use)
    }
}

/// What `acquire` decided while holding the lock.
enum Step<C> {
    Claimed(PoolEntry<C>),
    Connect,
    Wait {
        id: u64,
        deadline: Instant,
        rx: oneshot::Receiver<EntryResult<C>>,
    },
}

/// Status information about one destination's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently held by callers.
    pub in_use: usize,
    /// Total number of connections, including ones being opened.
    pub total: usize,
    /// Number of queued acquisitions.
    pub pending: usize,
    /// Maximum allowed connections.
    pub max: Limit,
}

impl PoolStatus {
    /// Percentage of the bound currently held by callers.
    ///
    /// Elastic pools are measured against their current total.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let capacity = self.max.get().unwrap_or(self.total);
        if capacity == 0 {
            0.0
        } else {
            (self.in_use as f64 / capacity as f64) * 100.0
        }
    }
}

/// The pool for a single destination.
pub(crate) struct Pool<T: Transport> {
    key: DestinationKey,
    config: Arc<PoolConfig>,
    transport: Arc<T>,
    state: Mutex<PoolState<T::Connection>>,
    runtime: Handle,
    eviction: CancellationToken,
    drained: Notify,
    shutdown: OnceLock<Shared<BoxFuture<'static, ()>>>,
}

impl<T: Transport> Pool<T> {
    /// Create a pool and start its eviction sweep, if eviction is configured.
    pub(crate) fn new(
        key: DestinationKey,
        config: Arc<PoolConfig>,
        transport: Arc<T>,
        runtime: Handle,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            key,
            config,
            transport,
            state: Mutex::new(PoolState::new()),
            runtime,
            eviction: CancellationToken::new(),
            drained: Notify::new(),
            shutdown: OnceLock::new(),
        });

        if let Some(interval) = pool.config.eviction_interval() {
            evict::spawn_sweeper(&pool, interval);
        }

        tracing::debug!(
            pool = %pool.config.name(),
            destination = %pool.key,
            max_connections = %pool.config.max_connections(),
            "created destination pool"
        );
        pool
    }

    pub(crate) fn key(&self) -> &DestinationKey {
        &self.key
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn eviction_token(&self) -> &CancellationToken {
        &self.eviction
    }

    /// Get a connection, following the acquisition state machine.
    pub(crate) async fn acquire(self: Arc<Self>) -> Result<PooledConnection<T>> {
        let now = Instant::now();
        let mut stale = Vec::new();

        let step = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            self.decide(&mut state, now, &mut stale)
        };
        self.spawn_close(stale);

        match step {
            Ok(Step::Claimed(entry)) => {
                tracing::trace!(
                    pool = %self.config.name(),
                    destination = %self.key,
                    connection_id = entry.meta.id,
                    "reusing idle connection"
                );
                Ok(PooledConnection::pooled(entry, self))
            }
            Ok(Step::Connect) => self.connect().await,
            Ok(Step::Wait { id, deadline, rx }) => {
                tracing::trace!(
                    pool = %self.config.name(),
                    destination = %self.key,
                    request_id = id,
                    "pool at capacity, queueing acquisition"
                );
                Waiter {
                    pool: self,
                    id,
                    deadline,
                    rx,
                    done: false,
                }
                .wait()
                .await
            }
            Err(e) => Err(e),
        }
    }

    fn decide(
        &self,
        state: &mut PoolState<T::Connection>,
        now: Instant,
        stale: &mut Vec<PoolEntry<T::Connection>>,
    ) -> Result<Step<T::Connection>> {
        while let Some(entry) = state.idle.pop_back() {
            if entry.is_reusable(self.config.max_idle_time(), self.config.max_life_time(), now) {
                state.in_use += 1;
                return Ok(Step::Claimed(entry));
            }
            state.retire(entry, stale);
        }

        let max = self.config.max_connections();
        if max.admits(state.allocated) {
            state.allocated += 1;
            return Ok(Step::Connect);
        }

        if self.config.never_waits() {
            return Err(PoolError::PoolExhausted {
                max: max.get().unwrap_or(usize::MAX),
            });
        }

        let max_pending = self.config.max_pending_acquire();
        if !max_pending.admits(state.pending.len()) {
            return Err(PoolError::TooManyPending {
                max: max_pending.get().unwrap_or(usize::MAX),
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = state.request_id();
        let deadline = now
            .checked_add(self.config.acquire_timeout())
            .unwrap_or_else(|| now + FAR_FUTURE);
        state.pending.push_back(PendingRequest {
            id,
            enqueued_at: now,
            deadline,
            tx,
        });
        Ok(Step::Wait { id, deadline, rx })
    }

    /// Open a connection into a slot already reserved by `decide`.
    async fn connect(self: Arc<Self>) -> Result<PooledConnection<T>> {
        let reservation = Reservation {
            pool: Some(Arc::clone(&self)),
        };

        let conn = match self.transport.connect(&self.key).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(
                    pool = %self.config.name(),
                    destination = %self.key,
                    error = %e,
                    "failed to open connection"
                );
                drop(reservation);
                return Err(PoolError::ConnectionCreation(e));
            }
        };

        let admitted = {
            let mut state = self.state.lock();
            if state.closed {
                let mut to_close = Vec::new();
                let entry = PoolEntry::new(conn, state.connection_id());
                state.retire(entry, &mut to_close);
                Err(to_close)
            } else {
                state.in_use += 1;
                Ok(PoolEntry::new(conn, state.connection_id()))
            }
        };
        reservation.disarm();

        match admitted {
            Ok(entry) => {
                tracing::debug!(
                    pool = %self.config.name(),
                    destination = %self.key,
                    connection_id = entry.meta.id,
                    "opened new connection"
                );
                Ok(PooledConnection::pooled(entry, self))
            }
            Err(to_close) => {
                self.spawn_close(to_close);
                self.notify_if_closed();
                Err(PoolError::PoolClosed)
            }
        }
    }

    /// Give a freed slot back, starting creations for queued waiters.
    fn release_slot(self: &Arc<Self>) {
        let creations = {
            let mut state = self.state.lock();
            state.allocated -= 1;
            self.reserve_for_pending(&mut state)
        };
        self.notify_if_closed();
        self.spawn_creations(creations);
    }

    /// Return a connection from a caller.
    pub(crate) fn release(self: &Arc<Self>, entry: PoolEntry<T::Connection>) {
        let now = Instant::now();
        let mut to_close = Vec::new();

        let creations = {
            let mut state = self.state.lock();
            state.in_use -= 1;

            let reason = if state.closed {
                Some("pool closed")
            } else if !entry.conn.is_healthy() {
                Some("unhealthy")
            } else if entry.meta.is_expired(self.config.max_life_time(), now) {
                Some("max life time exceeded")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tracing::debug!(
                        pool = %self.config.name(),
                        destination = %self.key,
                        connection_id = entry.meta.id,
                        reason,
                        "closing released connection"
                    );
                    state.retire(entry, &mut to_close);
                    self.reserve_for_pending(&mut state)
                }
                None => {
                    self.hand_off(&mut state, entry, now);
                    0
                }
            }
        };

        self.spawn_close(to_close);
        self.notify_if_closed();
        self.spawn_creations(creations);
    }

    /// Forget a connection the caller took out of the pool.
    pub(crate) fn detach(self: &Arc<Self>) {
        let creations = {
            let mut state = self.state.lock();
            state.in_use -= 1;
            state.allocated -= 1;
            self.reserve_for_pending(&mut state)
        };
        self.notify_if_closed();
        self.spawn_creations(creations);
    }

    /// Hand a healthy entry to the oldest live waiter, or park it as idle.
    ///
    /// Waiters whose deadline has passed are failed and skipped.
    fn hand_off(
        &self,
        state: &mut PoolState<T::Connection>,
        mut entry: PoolEntry<T::Connection>,
        now: Instant,
    ) {
        while let Some(request) = state.pending.pop_front() {
            if request.deadline <= now {
                let _ = request
                    .tx
                    .send(Err(PoolError::AcquisitionTimeout(self.config.acquire_timeout())));
                continue;
            }

            tracing::trace!(
                pool = %self.config.name(),
                destination = %self.key,
                connection_id = entry.meta.id,
                request_id = request.id,
                waited = ?now.saturating_duration_since(request.enqueued_at),
                "handing connection to queued acquisition"
            );
            let Err(Ok(returned)) = request.tx.send(Ok(entry)) else {
                state.in_use += 1;
                return;
            };
            // the waiter went away; try the next one
            entry = returned;
        }

        entry.meta.mark_released(now);
        state.idle.push_back(entry);
    }

    /// Deliver an error to the oldest live waiter.
    fn fail_oldest(&self, state: &mut PoolState<T::Connection>, mut error: PoolError, now: Instant) {
        while let Some(request) = state.pending.pop_front() {
            if request.deadline <= now {
                let _ = request
                    .tx
                    .send(Err(PoolError::AcquisitionTimeout(self.config.acquire_timeout())));
                continue;
            }
            match request.tx.send(Err(error)) {
                Ok(()) => return,
                Err(Err(returned)) => error = returned,
                Err(Ok(_)) => return,
            }
        }
    }

    /// Reserve slots for queued waiters while capacity allows.
    fn reserve_for_pending(&self, state: &mut PoolState<T::Connection>) -> usize {
        let max = self.config.max_connections();
        let mut reserved = 0;
        while !state.closed && state.pending.len() > reserved && max.admits(state.allocated) {
            state.allocated += 1;
            reserved += 1;
        }
        reserved
    }

    fn spawn_creations(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let pool = Arc::clone(self);
            self.runtime.spawn(async move { pool.create_for_pending().await });
        }
    }

    /// Open a connection on behalf of the queue; the slot is already reserved.
    async fn create_for_pending(self: Arc<Self>) {
        let result = self.transport.connect(&self.key).await;
        let now = Instant::now();
        let mut to_close = Vec::new();

        let creations = {
            let mut state = self.state.lock();
            match result {
                Ok(conn) if state.closed => {
                    let entry = PoolEntry::new(conn, state.connection_id());
                    state.retire(entry, &mut to_close);
                    0
                }
                Ok(conn) => {
                    let entry = PoolEntry::new(conn, state.connection_id());
                    tracing::debug!(
                        pool = %self.config.name(),
                        destination = %self.key,
                        connection_id = entry.meta.id,
                        "opened new connection for queued acquisition"
                    );
                    self.hand_off(&mut state, entry, now);
                    0
                }
                Err(e) => {
                    tracing::debug!(
                        pool = %self.config.name(),
                        destination = %self.key,
                        error = %e,
                        "failed to open connection for queued acquisition"
                    );
                    state.allocated -= 1;
                    self.fail_oldest(&mut state, PoolError::ConnectionCreation(e), now);
                    self.reserve_for_pending(&mut state)
                }
            }
        };

        self.spawn_close(to_close);
        self.notify_if_closed();
        self.spawn_creations(creations);
    }

    /// Close idle entries past their idle or life limits.
    ///
    /// Returns how many entries were evicted.
    pub(crate) fn evict_expired(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let mut to_close = Vec::new();

        let creations = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let idle = std::mem::take(&mut state.idle);
            for entry in idle {
                if entry.is_reusable(self.config.max_idle_time(), self.config.max_life_time(), now)
                {
                    state.idle.push_back(entry);
                } else {
                    state.retire(entry, &mut to_close);
                }
            }
            self.reserve_for_pending(&mut state)
        };

        let evicted = to_close.len();
        if evicted > 0 {
            tracing::debug!(
                pool = %self.config.name(),
                destination = %self.key,
                evicted,
                "evicted expired idle connections"
            );
        }
        self.spawn_close(to_close);
        self.spawn_creations(creations);
        evicted
    }

    fn spawn_close(self: &Arc<Self>, entries: Vec<PoolEntry<T::Connection>>) {
        for entry in entries {
            tracing::trace!(
                pool = %self.config.name(),
                destination = %self.key,
                connection_id = entry.meta.id,
                acquire_count = entry.meta.acquire_count,
                state = ?entry.meta.state,
                "closing connection"
            );
            let pool = Arc::clone(self);
            self.runtime.spawn(async move {
                pool.transport.close(entry.conn).await;
                pool.state.lock().closing -= 1;
                pool.notify_if_closed();
            });
        }
    }

    fn notify_if_closed(&self) {
        if self.state.lock().closed {
            self.drained.notify_waiters();
        }
    }

    /// Remove a queued request. Returns `false` if it was already dequeued.
    fn remove_pending(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending.iter().position(|r| r.id == id) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the pool's counters.
    pub(crate) fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            available: state.idle.len(),
            in_use: state.in_use,
            total: state.allocated,
            pending: state.pending.len(),
            max: self.config.max_connections(),
        }
    }

    /// Shut the pool down.
    ///
    /// The first call fails every queued acquisition, starts closing idle
    /// connections and stops the eviction sweep. Every call returns the same
    /// future, which completes once the pool is drained.
    pub(crate) fn shutdown(self: &Arc<Self>) -> Shared<BoxFuture<'static, ()>> {
        self.shutdown.get_or_init(|| self.begin_shutdown()).clone()
    }

    fn begin_shutdown(self: &Arc<Self>) -> Shared<BoxFuture<'static, ()>> {
        let mut to_close = Vec::new();
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            for entry in idle {
                state.retire(entry, &mut to_close);
            }
            std::mem::take(&mut state.pending)
        };
        self.eviction.cancel();

        tracing::debug!(
            pool = %self.config.name(),
            destination = %self.key,
            pending = pending.len(),
            idle = to_close.len(),
            "shutting down destination pool"
        );

        for request in pending {
            let _ = request.tx.send(Err(PoolError::PoolClosed));
        }
        self.spawn_close(to_close);

        let pool = Arc::clone(self);
        async move {
            pool.drain().await;
            tracing::debug!(
                pool = %pool.config.name(),
                destination = %pool.key,
                "destination pool closed"
            );
        }
        .boxed()
        .shared()
    }

    /// Wait until every slot is free and every close has finished.
    ///
    /// The grace period, if any, caps the wait for connections held by
    /// callers. Connections being opened or closed are always waited for.
    async fn drain(&self) {
        let mut deadline = self
            .config
            .dispose_grace_period()
            .map(|g| Instant::now().checked_add(g).unwrap_or_else(|| Instant::now() + FAR_FUTURE));
        let mut grace_elapsed = false;

        loop {
            let notified = self.drained.notified();
            let (in_use, busy) = {
                let state = self.state.lock();
                if state.allocated == 0 && state.closing == 0 {
                    return;
                }
                (state.in_use, state.connecting() + state.closing)
            };

            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        tracing::warn!(
                            pool = %self.config.name(),
                            destination = %self.key,
                            in_use,
                            "grace period elapsed with connections still in use"
                        );
                        deadline = None;
                        grace_elapsed = true;
                    }
                }
                None if grace_elapsed && busy == 0 => return,
                None => notified.await,
            }
        }
    }
}

/// A slot reserved for a connection being opened.
///
/// Dropping it without [`disarm`](Self::disarm) gives the slot back, which
/// covers both a failed connect and an acquisition cancelled mid-connect.
struct Reservation<T: Transport> {
    pool: Option<Arc<Pool<T>>>,
}

impl<T: Transport> Reservation<T> {
    fn disarm(mut self) {
        self.pool = None;
    }
}

impl<T: Transport> Drop for Reservation<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_slot();
        }
    }
}

/// An acquisition waiting in the queue.
///
/// Dropping it before resolution removes the queued request. If a
/// connection was already handed over, it goes back to the pool.
struct Waiter<T: Transport> {
    pool: Arc<Pool<T>>,
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<EntryResult<T::Connection>>,
    done: bool,
}

impl<T: Transport> Waiter<T> {
    async fn wait(mut self) -> Result<PooledConnection<T>> {
        let received = tokio::select! {
            biased;
            received = &mut self.rx => received,
            () = tokio::time::sleep_until(self.deadline) => {
                if self.pool.remove_pending(self.id) {
                    self.done = true;
                    tracing::debug!(
                        pool = %self.pool.config.name(),
                        destination = %self.pool.key,
                        request_id = self.id,
                        "queued acquisition timed out"
                    );
                    return Err(PoolError::AcquisitionTimeout(self.pool.config.acquire_timeout()));
                }
                // resolved concurrently with the deadline; the result is already sent
                (&mut self.rx).await
            }
        };
        self.done = true;

        match received {
            Ok(Ok(entry)) => Ok(PooledConnection::pooled(entry, Arc::clone(&self.pool))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::PoolClosed),
        }
    }
}

impl<T: Transport> Drop for Waiter<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.pool.remove_pending(self.id) {
            tracing::trace!(
                pool = %self.pool.config.name(),
                destination = %self.pool.key,
                request_id = self.id,
                "queued acquisition cancelled"
            );
            return;
        }
        self.rx.close();
        if let Ok(Ok(entry)) = self.rx.try_recv() {
            self.pool.release(entry);
        }
    }
}
