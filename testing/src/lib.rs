//! # Courier Testing
//!
//! Testing utilities for the Courier messaging layer.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a [`Broker`](courier_core::Broker) with call counters
//!   and failure injection
//! - [`handlers`]: recording, failing and slow message handlers
//! - [`init_tracing`]: test log output controlled by `RUST_LOG`
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{InMemoryBroker, handlers::Recording};
//!
//! #[tokio::test(start_paused = true)]
//! async fn handles_booking() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let recording = Arc::new(Recording::new());
//!     let mut host = MessagingHost::with_broker(broker.clone());
//!     host.register_queue(Queue::new("emails"))?
//!         .register_message_handler("emails", recording.clone())?;
//!     host.start().await?;
//!     // publish, advance time, assert on recording.count()
//! }
//! ```

pub mod broker;
pub mod handlers;

pub use broker::{BrokerFailure, CallCounts, InMemoryBroker};

/// Install a `tracing` subscriber for tests.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
