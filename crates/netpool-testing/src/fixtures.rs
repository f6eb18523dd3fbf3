//! Test fixture utilities.

use std::time::Duration;

use netpool::{ConnectionProvider, ConnectionProviderBuilder, Limit, PoolDefaults};
use once_cell::sync::OnceCell;

use crate::mock_transport::MockTransport;

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; output goes through the test harness so it only shows
/// for failing tests.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Defaults that do not depend on the host or the environment.
///
/// 16 connections per destination and a 45 second acquire timeout.
#[must_use]
pub fn fixed_defaults() -> PoolDefaults {
    PoolDefaults {
        max_connections: Limit::from_raw(16, "max connections").unwrap_or(Limit::Unbounded),
        acquire_timeout: Duration::from_secs(45),
    }
}

/// A builder seeded from [`fixed_defaults`].
pub fn builder(name: &str) -> ConnectionProviderBuilder {
    ConnectionProviderBuilder::with_defaults(name, fixed_defaults())
}

/// A bounded provider over `transport`.
///
/// # Panics
///
/// Panics if `max_connections` is not strictly positive.
#[allow(clippy::expect_used)]
pub fn bounded_provider(
    transport: &MockTransport,
    max_connections: i32,
    acquire_timeout: Duration,
) -> ConnectionProvider<MockTransport> {
    builder("test")
        .acquire_timeout(acquire_timeout)
        .max_connections(max_connections)
        .expect("max connections must be positive")
        .build(transport.clone())
}

/// Let spawned tasks run until they block.
///
/// Under a paused clock this also lets time advance to the next timer, so it
/// is only safe to call when no timer of interest is due within a
/// millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
