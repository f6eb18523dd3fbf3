//! Mock transport for pool tests.
//!
//! [`MockTransport`] opens in-memory connections and counts everything the
//! pool asks of it, so tests can assert how many connections were opened,
//! closed, or open at the same time. Failures and latency can be injected
//! per transport or per address.
//!
//! ## Example
//!
//! ```rust,ignore
//! use netpool_testing::MockTransport;
//!
//! let transport = MockTransport::builder()
//!     .connect_latency(Duration::from_millis(20))
//!     .refuse("down:1")
//!     .build();
//!
//! let provider = netpool::builder("test").build(transport.clone());
//! // ...
//! assert_eq!(transport.connects(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use netpool::{BoxError, Connection, DestinationKey, Transport};
use parking_lot::Mutex;
use thiserror::Error;

/// Error returned by the mock transport when a connect fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MockTransportError {
    /// The address is configured to refuse connections.
    #[error("connection refused by {address}")]
    Refused {
        /// Destination address.
        address: String,
    },

    /// A failure queued with [`MockTransport::fail_next`].
    #[error("injected connect failure for {address}")]
    Injected {
        /// Destination address.
        address: String,
    },
}

/// A connection opened by [`MockTransport`].
///
/// Clones share the health flag, so a test can keep a clone and break the
/// connection while the pool owns it.
#[derive(Clone)]
pub struct MockConnection {
    id: u64,
    address: Arc<str>,
    broken: Arc<AtomicBool>,
}

impl MockConnection {
    /// Transport-wide connection number, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address the connection was opened to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Make the connection report itself unhealthy.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Connection for MockConnection {
    fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Clone, Default)]
pub struct MockTransportBuilder {
    connect_latency: Duration,
    close_latency: Duration,
    refused: HashSet<String>,
}

impl MockTransportBuilder {
    /// Create a builder with no latency and no failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connect by this long.
    #[must_use]
    pub fn connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Delay every close by this long.
    #[must_use]
    pub fn close_latency(mut self, latency: Duration) -> Self {
        self.close_latency = latency;
        self
    }

    /// Refuse every connect to `address`.
    #[must_use]
    pub fn refuse(mut self, address: impl Into<String>) -> Self {
        self.refused.insert(address.into());
        self
    }

    /// Build the transport.
    #[must_use]
    pub fn build(self) -> MockTransport {
        MockTransport {
            inner: Arc::new(Inner {
                connect_latency: self.connect_latency,
                close_latency: self.close_latency,
                refused: Mutex::new(self.refused),
                pending_failures: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                stats: Stats::default(),
                per_address: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    attempts: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
}

struct Inner {
    connect_latency: Duration,
    close_latency: Duration,
    refused: Mutex<HashSet<String>>,
    pending_failures: AtomicUsize,
    next_id: AtomicU64,
    stats: Stats,
    per_address: Mutex<HashMap<String, usize>>,
}

/// In-memory [`Transport`] with counters and failure injection.
///
/// Cheap to clone; clones share counters and configuration.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    /// Create a transport with no latency and no failures.
    #[must_use]
    pub fn new() -> Self {
        MockTransportBuilder::new().build()
    }

    /// Fail the next `n` connects, whatever their address.
    pub fn fail_next(&self, n: usize) {
        self.inner.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Start refusing connects to `address`.
    pub fn refuse(&self, address: impl Into<String>) {
        self.inner.refused.lock().insert(address.into());
    }

    /// Stop refusing connects to `address`.
    pub fn accept(&self, address: &str) {
        self.inner.refused.lock().remove(address);
    }

    /// Number of connect calls, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.inner.stats.attempts.load(Ordering::SeqCst)
    }

    /// Number of connections opened.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.inner.stats.connects.load(Ordering::SeqCst)
    }

    /// Number of connections opened to `address`.
    #[must_use]
    pub fn connects_to(&self, address: &str) -> usize {
        self.inner
            .per_address
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Number of connections closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.inner.stats.closes.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.stats.open.load(Ordering::SeqCst)
    }

    /// Highest number of connections open at the same time.
    #[must_use]
    pub fn peak_open_connections(&self) -> usize {
        self.inner.stats.peak_open.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.inner
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("connects", &self.connects())
            .field("closes", &self.closes())
            .field("open", &self.open_connections())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, destination: &DestinationKey) -> Result<MockConnection, BoxError> {
        let address = destination.address();
        self.inner.stats.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.inner.connect_latency.is_zero() {
            tokio::time::sleep(self.inner.connect_latency).await;
        }

        if self.inner.refused.lock().contains(address) {
            tracing::trace!(address, "mock transport refusing connect");
            return Err(Box::new(MockTransportError::Refused {
                address: address.to_owned(),
            }));
        }
        if self.take_failure() {
            tracing::trace!(address, "mock transport injecting connect failure");
            return Err(Box::new(MockTransportError::Injected {
                address: address.to_owned(),
            }));
        }

        let stats = &self.inner.stats;
        stats.connects.fetch_add(1, Ordering::SeqCst);
        let open = stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_open.fetch_max(open, Ordering::SeqCst);
        *self
            .inner
            .per_address
            .lock()
            .entry(address.to_owned())
            .or_insert(0) += 1;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(address, id, "mock transport opened connection");
        Ok(MockConnection {
            id,
            address: Arc::from(address),
            broken: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn close(&self, connection: MockConnection) {
        if !self.inner.close_latency.is_zero() {
            tokio::time::sleep(self.inner.close_latency).await;
        }
        self.inner.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.open.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(
            address = connection.address(),
            id = connection.id(),
            "mock transport closed connection"
        );
    }
}
