//! In-crate transport used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::BoxError;
use crate::key::DestinationKey;
use crate::lifecycle::{Connection, Transport};

#[derive(Debug, Clone, Default)]
pub(crate) struct TestConnection {
    broken: Arc<AtomicBool>,
}

impl TestConnection {
    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Connection for TestConnection {
    fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    closes: AtomicUsize,
    failures: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TestTransport {
    counters: Arc<Counters>,
}

impl TestTransport {
    pub(crate) fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.counters.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Transport for TestTransport {
    type Connection = TestConnection;

    async fn connect(&self, _destination: &DestinationKey) -> Result<TestConnection, BoxError> {
        let failing = self
            .counters
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("connection refused".into());
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(TestConnection::default())
    }

    async fn close(&self, _connection: TestConnection) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
