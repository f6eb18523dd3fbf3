//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by a [`Transport`](crate::Transport) when it fails
/// to open a connection.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool operations.
///
/// Every error resolves exactly one acquisition. A failure for one caller
/// never affects other queued acquisitions or other destinations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// A builder argument was rejected.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// The pool is at capacity and is configured to never wait.
    #[error("connection pool exhausted: maximum connections ({max}) reached")]
    PoolExhausted {
        /// Maximum allowed connections.
        max: usize,
    },

    /// The pending acquisition queue is full.
    #[error("too many pending acquisitions: queue limit ({max}) reached")]
    TooManyPending {
        /// Maximum allowed pending acquisitions.
        max: usize,
    },

    /// A queued acquisition was not satisfied before its deadline.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The transport failed to open a connection.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(#[source] BoxError),

    /// The pool or provider has been disposed.
    #[error("pool is closed")]
    PoolClosed,
}

impl PoolError {
    /// Check if this error is transient and the acquisition may succeed
    /// if the caller tries again later.
    ///
    /// The pool never retries by itself; this is a hint for callers that
    /// implement their own retry policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::TooManyPending { .. }
                | Self::AcquisitionTimeout(_)
                | Self::ConnectionCreation(_)
        )
    }

    /// Check if this error was caused by disposal of the pool.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
