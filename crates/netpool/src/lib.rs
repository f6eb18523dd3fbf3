//! # netpool
//!
//! Per-destination connection pooling for async network clients.
//!
//! A [`ConnectionProvider`] hands out connections keyed by a
//! [`DestinationKey`]. In pooled mode each destination gets its own bounded
//! pool: idle connections are reused, new ones are opened while under the
//! bound, and once at capacity acquisitions queue in FIFO order until a
//! connection is released or their deadline passes. The transport itself
//! stays behind the [`Transport`] trait.
//!
//! ## Features
//!
//! - Bounded or elastic pools, one per destination
//! - FIFO pending queue with an optional size limit and acquire deadline
//! - Idle-time and life-time eviction with a background sweep
//! - Health check on every claim and release
//! - Cancellation-safe acquisition
//! - Per-destination or whole-provider disposal with an optional grace period
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! let provider = netpool::builder("upstream")
//!     .max_connections(20)?
//!     .acquire_timeout(Duration::from_secs(5))
//!     .max_idle_time(Duration::from_secs(60))
//!     .build(transport);
//!
//! let conn = provider.acquire("10.0.0.1:443").await?;
//! // Use connection...
//! drop(conn); // returned to the pool
//!
//! // completes once every connection has been released and closed
//! provider.dispose_later().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod acquire;
pub mod config;
pub mod connection;
pub mod error;
pub mod key;
pub mod lifecycle;
pub mod pool;
pub mod provider;

mod evict;
mod registry;

#[cfg(test)]
mod test_support;

pub use acquire::{Acquire, Disposal};
pub use config::{
    ACQUIRE_TIMEOUT_NEVER_WAIT, ConnectionProviderBuilder, DEFAULT_ACQUIRE_TIMEOUT,
    ENV_ACQUIRE_TIMEOUT_MS, ENV_MAX_CONNECTIONS, Limit, MAX_CONNECTIONS_ELASTIC,
    MAX_PENDING_ACQUIRE_UNBOUNDED, PoolConfig, PoolDefaults,
};
pub use connection::PooledConnection;
pub use error::{BoxError, PoolError, Result};
pub use key::DestinationKey;
pub use lifecycle::{Connection, ConnectionMetadata, ConnectionState, Transport};
pub use pool::PoolStatus;
pub use provider::{ConnectionProvider, NewConnectionProvider, PooledConnectionProvider, builder};
