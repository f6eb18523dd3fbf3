//! # netpool-testing
//!
//! Test infrastructure for netpool.
//!
//! Pool behavior tests live in this crate's `tests/` directory so they run
//! against the public API with a transport that records every connect and
//! close.
//!
//! ## Features
//!
//! - [`MockTransport`] with connect/close counters and peak-open tracking
//! - Failure injection, per address or for the next N connects
//! - Simulated connect and close latency
//! - Fixtures for providers with host-independent defaults
//!
//! ## Example
//!
//! ```rust,ignore
//! use netpool_testing::{MockTransport, fixtures};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_reuse() {
//!     let transport = MockTransport::new();
//!     let provider = fixtures::bounded_provider(&transport, 2, Duration::from_secs(5));
//!
//!     drop(provider.acquire("a:1").await.unwrap());
//!     drop(provider.acquire("a:1").await.unwrap());
//!     assert_eq!(transport.connects(), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_transport;

pub use mock_transport::{MockConnection, MockTransport, MockTransportBuilder, MockTransportError};
