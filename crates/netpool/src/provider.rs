//! Connection providers.
//!
//! A [`ConnectionProvider`] is either pooled, keeping one pool per
//! destination, or always-create, opening a fresh connection for every
//! acquisition and closing it on release.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use tokio::runtime::Handle;

use crate::acquire::{Acquire, Disposal};
use crate::config::{ConnectionProviderBuilder, Limit, PoolConfig, PoolDefaults};
use crate::connection::PooledConnection;
use crate::error::{PoolError, Result};
use crate::key::DestinationKey;
use crate::lifecycle::{PoolEntry, Transport};
use crate::pool::{Pool, PoolStatus};
use crate::registry::PoolRegistry;

/// Create a builder for a pooled provider named `name`.
///
/// Shorthand for [`ConnectionProviderBuilder::new`].
pub fn builder(name: impl Into<String>) -> ConnectionProviderBuilder {
    ConnectionProviderBuilder::new(name)
}

/// Hands out connections, pooled or not.
pub enum ConnectionProvider<T: Transport> {
    /// One bounded pool per destination.
    Pooled(PooledConnectionProvider<T>),
    /// A new connection for every acquisition.
    NewConnection(NewConnectionProvider<T>),
}

impl<T: Transport> ConnectionProvider<T> {
    /// Create a pooled provider with the process-wide defaults.
    pub fn create(name: impl Into<String>, transport: T) -> Self {
        ConnectionProviderBuilder::new(name).build(transport)
    }

    /// Create a pooled provider with the given connection bound.
    ///
    /// `-1` creates an elastic pool; any other value must be strictly
    /// positive.
    pub fn create_with_max(name: impl Into<String>, max_connections: i32, transport: T) -> Result<Self> {
        Ok(ConnectionProviderBuilder::new(name)
            .max_connections(max_connections)?
            .build(transport))
    }

    /// Create a pooled provider seeded from explicit defaults.
    pub fn create_with_defaults(name: impl Into<String>, defaults: PoolDefaults, transport: T) -> Self {
        ConnectionProviderBuilder::with_defaults(name, defaults).build(transport)
    }

    /// Create a provider that opens a new connection for every acquisition.
    pub fn new_connection(transport: T) -> Self {
        Self::NewConnection(NewConnectionProvider::new(transport))
    }

    pub(crate) fn pooled(config: PoolConfig, transport: T) -> Self {
        Self::Pooled(PooledConnectionProvider::new(config, transport))
    }

    /// Acquire a connection to `destination`.
    ///
    /// The returned future is lazy; see [`Acquire`].
    pub fn acquire(&self, destination: impl Into<DestinationKey>) -> Acquire<T> {
        match self {
            Self::Pooled(p) => p.acquire(destination),
            Self::NewConnection(p) => p.acquire(destination),
        }
    }

    /// Start disposing the provider without waiting for it to finish.
    pub fn dispose(&self) {
        if let Self::Pooled(p) = self {
            p.dispose();
        }
    }

    /// Dispose every pool. Nothing happens until the future is polled.
    pub fn dispose_later(&self) -> Disposal {
        match self {
            Self::Pooled(p) => p.dispose_later(),
            Self::NewConnection(_) => Disposal::completed(),
        }
    }

    /// Dispose the pool for one destination, leaving the others alone.
    pub fn dispose_when(&self, destination: &DestinationKey) -> Disposal {
        match self {
            Self::Pooled(p) => p.dispose_when(destination),
            Self::NewConnection(_) => Disposal::completed(),
        }
    }

    /// The per-destination connection bound.
    #[must_use]
    pub fn max_connections(&self) -> Limit {
        match self {
            Self::Pooled(p) => p.config().max_connections(),
            Self::NewConnection(_) => Limit::Unbounded,
        }
    }

    /// Status of the pool for `destination`, if one exists.
    #[must_use]
    pub fn status(&self, destination: &DestinationKey) -> Option<PoolStatus> {
        match self {
            Self::Pooled(p) => p.status(destination),
            Self::NewConnection(_) => None,
        }
    }

    /// Number of destination pools currently registered.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        match self {
            Self::Pooled(p) => p.pool_count(),
            Self::NewConnection(_) => 0,
        }
    }

    /// Check whether the provider has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        match self {
            Self::Pooled(p) => p.is_disposed(),
            Self::NewConnection(_) => false,
        }
    }
}

impl<T: Transport> Clone for ConnectionProvider<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Pooled(p) => Self::Pooled(p.clone()),
            Self::NewConnection(p) => Self::NewConnection(p.clone()),
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled(p) => f.debug_tuple("Pooled").field(p).finish(),
            Self::NewConnection(p) => f.debug_tuple("NewConnection").field(p).finish(),
        }
    }
}

struct ProviderInner<T: Transport> {
    config: Arc<PoolConfig>,
    transport: Arc<T>,
    registry: PoolRegistry<T>,
    disposed: AtomicBool,
    disposal: OnceLock<Shared<BoxFuture<'static, ()>>>,
}

impl<T: Transport> ProviderInner<T> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    async fn dispose_all(self: Arc<Self>) {
        self.disposed.store(true, Ordering::Release);
        tracing::info!(
            pool = %self.config.name(),
            pools = self.registry.len(),
            "disposing connection provider"
        );

        // an acquisition racing with disposal may still register a pool
        loop {
            let pools = self.registry.snapshot();
            if pools.is_empty() {
                break;
            }
            join_all(pools.into_iter().map(|(key, pool)| {
                let inner = Arc::clone(&self);
                async move {
                    pool.shutdown().await;
                    inner.registry.remove_if_same(&key, &pool);
                }
            }))
            .await;
        }

        tracing::info!(pool = %self.config.name(), "connection provider disposed");
    }
}

/// Provider keeping one pool per destination.
pub struct PooledConnectionProvider<T: Transport> {
    inner: Arc<ProviderInner<T>>,
}

impl<T: Transport> PooledConnectionProvider<T> {
    fn new(config: PoolConfig, transport: T) -> Self {
        tracing::debug!(
            pool = %config.name(),
            max_connections = %config.max_connections(),
            max_pending_acquire = %config.max_pending_acquire(),
            acquire_timeout = ?config.acquire_timeout(),
            "created pooled connection provider"
        );
        Self {
            inner: Arc::new(ProviderInner {
                config: Arc::new(config),
                transport: Arc::new(transport),
                registry: PoolRegistry::new(),
                disposed: AtomicBool::new(false),
                disposal: OnceLock::new(),
            }),
        }
    }

    /// The frozen configuration shared by every pool.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    /// Acquire a connection to `destination`, creating its pool on first use.
    pub fn acquire(&self, destination: impl Into<DestinationKey>) -> Acquire<T> {
        let destination = destination.into();
        let inner = Arc::clone(&self.inner);

        Acquire::new(async move {
            if inner.is_disposed() {
                return Err(PoolError::PoolClosed);
            }

            let pool = inner.registry.get_or_create(&destination, || {
                Pool::new(
                    destination.clone(),
                    Arc::clone(&inner.config),
                    Arc::clone(&inner.transport),
                    Handle::current(),
                )
            });

            if inner.is_disposed() {
                // the disposal sweep may have missed this pool
                drop(pool.shutdown());
                return Err(PoolError::PoolClosed);
            }

            pool.acquire().await
        })
    }

    /// Start disposing without waiting for completion.
    ///
    /// New acquisitions fail immediately. Pools finish shutting down in the
    /// background when called from within a runtime. Outside a runtime they
    /// are shut down and unregistered at once, and connections still in use
    /// are closed when released.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let disposal = self.dispose_later();

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(disposal);
            }
            Err(_) => {
                // nothing can drive the drain from here; unregister right away
                for (key, pool) in self.inner.registry.snapshot() {
                    drop(pool.shutdown());
                    self.inner.registry.remove_if_same(&key, &pool);
                }
            }
        }
    }

    /// Dispose every pool.
    ///
    /// The returned future is cold. Once driven, it marks the provider as
    /// disposed, shuts every pool down and removes it from the registry. It
    /// completes only after every connection has been released and closed,
    /// or, with a grace period configured, once that period has elapsed and
    /// no connection is still being opened or closed. Every call shares the
    /// same disposal.
    pub fn dispose_later(&self) -> Disposal {
        let shared = self.inner.disposal.get_or_init(|| {
            let weak: Weak<ProviderInner<T>> = Arc::downgrade(&self.inner);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.dispose_all().await;
                }
            }
            .boxed()
            .shared()
        });
        Disposal::new(shared.clone())
    }

    /// Dispose the pool for one destination.
    ///
    /// Shutdown starts immediately: queued acquisitions fail and idle
    /// connections begin closing before the returned future is polled.
    /// Connections in use are closed when released. The registry entry is
    /// removed once the pool has drained, after which a new acquisition for
    /// the destination creates a fresh pool. Unknown destinations complete
    /// immediately.
    pub fn dispose_when(&self, destination: &DestinationKey) -> Disposal {
        let Some(pool) = self.inner.registry.get(destination) else {
            return Disposal::completed();
        };

        tracing::info!(
            pool = %self.inner.config.name(),
            destination = %destination,
            "disposing destination pool"
        );

        let closing = pool.shutdown();
        let inner = Arc::clone(&self.inner);
        let key = destination.clone();
        let runtime = pool.runtime().clone();
        let done = async move {
            closing.await;
            inner.registry.remove_if_same(&key, &pool);
        }
        .boxed()
        .shared();

        runtime.spawn(done.clone());
        Disposal::new(done)
    }

    /// Status of the pool for `destination`.
    #[must_use]
    pub fn status(&self, destination: &DestinationKey) -> Option<PoolStatus> {
        self.inner.registry.get(destination).map(|pool| pool.status())
    }

    /// Number of destination pools currently registered.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Check whether the provider has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl<T: Transport> Clone for PooledConnectionProvider<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for PooledConnectionProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnectionProvider")
            .field("config", &self.inner.config)
            .field("pools", &self.inner.registry.len())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

/// Provider opening a new connection for every acquisition.
///
/// Has no pools, so disposal does nothing and status is never available.
pub struct NewConnectionProvider<T: Transport> {
    transport: Arc<T>,
    next_id: Arc<AtomicU64>,
}

impl<T: Transport> NewConnectionProvider<T> {
    fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a connection to `destination`.
    pub fn acquire(&self, destination: impl Into<DestinationKey>) -> Acquire<T> {
        let destination = destination.into();
        let transport = Arc::clone(&self.transport);
        let next_id = Arc::clone(&self.next_id);

        Acquire::new(async move {
            let conn = transport
                .connect(&destination)
                .await
                .map_err(PoolError::ConnectionCreation)?;
            let entry = PoolEntry::new(conn, next_id.fetch_add(1, Ordering::Relaxed));
            tracing::trace!(
                destination = %destination,
                connection_id = entry.meta.id,
                "opened unpooled connection"
            );
            Ok(PooledConnection::unpooled(
                entry,
                destination,
                transport,
                Handle::current(),
            ))
        })
    }
}

impl<T: Transport> Clone for NewConnectionProvider<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T: Transport> std::fmt::Debug for NewConnectionProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewConnectionProvider").finish_non_exhaustive()
    }
}
