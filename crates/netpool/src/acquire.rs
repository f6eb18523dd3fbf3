//! Futures returned by provider operations.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::connection::PooledConnection;
use crate::error::Result;
use crate::lifecycle::Transport;

/// Future resolving to a connection.
///
/// Nothing happens until it is polled. Dropping it before it resolves
/// cancels the acquisition: a queued request leaves the queue, a
/// connection being opened for it is not leaked, and a connection that was
/// already handed over goes back to the pool.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Acquire<T: Transport> {
    inner: BoxFuture<'static, Result<PooledConnection<T>>>,
}

impl<T: Transport> Acquire<T> {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<PooledConnection<T>>> + Send + 'static,
    {
        Self {
            inner: future.boxed(),
        }
    }
}

impl<T: Transport> Future for Acquire<T> {
    type Output = Result<PooledConnection<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T: Transport> fmt::Debug for Acquire<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire").finish_non_exhaustive()
    }
}

/// Future completing when a disposal has finished.
///
/// Clones and repeated disposals of the same target share one underlying
/// shutdown, so it runs once no matter how many futures observe it.
#[derive(Clone)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Disposal {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl Disposal {
    pub(crate) fn new(inner: Shared<BoxFuture<'static, ()>>) -> Self {
        Self { inner }
    }

    /// A disposal with nothing to do.
    pub(crate) fn completed() -> Self {
        Self::new(futures_util::future::ready(()).boxed().shared())
    }
}

impl Future for Disposal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl fmt::Debug for Disposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposal").finish_non_exhaustive()
    }
}
