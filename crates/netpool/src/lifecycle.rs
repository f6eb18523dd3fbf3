//! Connection lifecycle management.
//!
//! This module defines the seam between the pool and the transport layer,
//! and the per-entry bookkeeping the pool uses to decide when a connection
//! may be reused and when it must be closed.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::BoxError;
use crate::key::DestinationKey;

/// A live transport resource handed out by the pool.
pub trait Connection: Send + 'static {
    /// Check if the connection can still carry traffic.
    ///
    /// This must be cheap and non-blocking: the pool calls it while holding
    /// its lock, on every claim and every release.
    fn is_healthy(&self) -> bool;
}

/// Opens and closes connections for the pool.
///
/// The pool never inspects a connection beyond [`Connection::is_healthy`];
/// everything else about the transport stays behind this trait.
///
/// Uses `#[async_trait]` so providers can be shared across tasks and the
/// futures it returns are `Send`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Open a new connection to `destination`.
    async fn connect(&self, destination: &DestinationKey) -> Result<Self::Connection, BoxError>;

    /// Close a connection. Best effort; errors are the transport's concern.
    async fn close(&self, connection: Self::Connection);
}

/// Connection state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is idle and available for use.
    Idle,
    /// Connection is held by a caller.
    Acquired,
    /// Connection is closed and no longer tracked.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection within its pool.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last returned to the pool.
    pub last_released_at: Instant,
    /// Number of times the connection has been checked out.
    pub acquire_count: u64,
    /// Current state of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    /// Create metadata for a freshly opened connection.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_released_at: now,
            acquire_count: 0,
            state: ConnectionState::Idle,
        }
    }

    /// Total age of the connection.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the connection was last released.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_released_at)
    }

    /// Check if the connection has exceeded its maximum lifetime.
    #[must_use]
    pub fn is_expired(&self, max_life_time: Option<Duration>, now: Instant) -> bool {
        max_life_time.is_some_and(|max| self.age(now) > max)
    }

    /// Check if the connection has been idle too long.
    #[must_use]
    pub fn is_idle_expired(&self, max_idle_time: Option<Duration>, now: Instant) -> bool {
        self.state.is_available() && max_idle_time.is_some_and(|max| self.idle_for(now) > max)
    }

    /// Mark the connection as checked out.
    pub fn mark_acquired(&mut self) {
        self.acquire_count += 1;
        self.state = ConnectionState::Acquired;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_released(&mut self, now: Instant) {
        self.last_released_at = now;
        self.state = ConnectionState::Idle;
    }

    /// Mark the connection as closed. Set when its slot is given up, just
    /// before it is handed to [`Transport::close`].
    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

/// A connection together with its pool metadata.
#[derive(Debug)]
pub(crate) struct PoolEntry<C> {
    pub(crate) conn: C,
    pub(crate) meta: ConnectionMetadata,
}

impl<C: Connection> PoolEntry<C> {
    pub(crate) fn new(conn: C, id: u64) -> Self {
        Self {
            conn,
            meta: ConnectionMetadata::new(id),
        }
    }

    /// Check whether an idle entry may be handed out.
    pub(crate) fn is_reusable(
        &self,
        max_idle_time: Option<Duration>,
        max_life_time: Option<Duration>,
        now: Instant,
    ) -> bool {
        self.conn.is_healthy()
            && !self.meta.is_idle_expired(max_idle_time, now)
            && !self.meta.is_expired(max_life_time, now)
    }
}
