//! Connection handles given to callers.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::key::DestinationKey;
use crate::lifecycle::{ConnectionMetadata, PoolEntry, Transport};
use crate::pool::Pool;

enum Origin<T: Transport> {
    Pooled(Arc<Pool<T>>),
    Unpooled {
        destination: DestinationKey,
        transport: Arc<T>,
        runtime: Handle,
    },
}

/// A connection checked out from a provider.
///
/// Dereferences to the transport's connection type. When dropped, a pooled
/// connection goes back to its pool (or is closed if it is no longer
/// reusable); a connection from an always-create provider is closed.
pub struct PooledConnection<T: Transport> {
    entry: Option<PoolEntry<T::Connection>>,
    origin: Origin<T>,
}

impl<T: Transport> PooledConnection<T> {
    pub(crate) fn pooled(mut entry: PoolEntry<T::Connection>, pool: Arc<Pool<T>>) -> Self {
        entry.meta.mark_acquired();
        Self {
            entry: Some(entry),
            origin: Origin::Pooled(pool),
        }
    }

    pub(crate) fn unpooled(
        mut entry: PoolEntry<T::Connection>,
        destination: DestinationKey,
        transport: Arc<T>,
        runtime: Handle,
    ) -> Self {
        entry.meta.mark_acquired();
        Self {
            entry: Some(entry),
            origin: Origin::Unpooled {
                destination,
                transport,
                runtime,
            },
        }
    }

    // The entry is only taken in `detach` and `drop`, both of which consume
    // the handle.
    #[allow(clippy::expect_used)]
    fn entry(&self) -> &PoolEntry<T::Connection> {
        self.entry.as_ref().expect("connection present until dropped")
    }

    #[allow(clippy::expect_used)]
    fn entry_mut(&mut self) -> &mut PoolEntry<T::Connection> {
        self.entry.as_mut().expect("connection present until dropped")
    }

    /// Pool bookkeeping for this connection.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.entry().meta
    }

    /// The destination this connection was opened to.
    #[must_use]
    pub fn destination(&self) -> &DestinationKey {
        match &self.origin {
            Origin::Pooled(pool) => pool.key(),
            Origin::Unpooled { destination, .. } => destination,
        }
    }

    /// Check whether this connection returns to a pool when dropped.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        matches!(self.origin, Origin::Pooled(_))
    }

    /// Take the connection out of the pool.
    ///
    /// The pool forgets about the connection and frees its slot. Closing it
    /// becomes the caller's responsibility.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn detach(mut self) -> T::Connection {
        let entry = self.entry.take().expect("connection present until dropped");
        if let Origin::Pooled(pool) = &self.origin {
            pool.detach();
        }
        entry.conn
    }
}

impl<T: Transport> Deref for PooledConnection<T> {
    type Target = T::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry().conn
    }
}

impl<T: Transport> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry_mut().conn
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        match &self.origin {
            Origin::Pooled(pool) => {
                tracing::trace!(
                    destination = %pool.key(),
                    connection_id = entry.meta.id,
                    "returning connection to pool"
                );
                pool.release(entry);
            }
            Origin::Unpooled {
                destination,
                transport,
                runtime,
            } => {
                tracing::trace!(
                    destination = %destination,
                    connection_id = entry.meta.id,
                    "closing unpooled connection"
                );
                let transport = Arc::clone(transport);
                runtime.spawn(async move { transport.close(entry.conn).await });
            }
        }
    }
}

impl<T: Transport> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("destination", self.destination())
            .field("metadata", &self.entry.as_ref().map(|e| &e.meta))
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
