//! # Courier Runtime
//!
//! Provisioning, publishing and the consumer loop for the Courier messaging
//! layer.
//!
//! ## Core Components
//!
//! - **Provisioning**: idempotent topic/queue/subscription creation
//! - **Publisher**: lazy, single-flight provisioning on first publish
//! - **`QueueWorker`**: long-poll loop with bounded concurrency and retries
//! - **`MessagingHost`**: registration surface and worker lifecycle
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{MessagingHost, Publisher};
//! use courier_core::{Queue, Topic, RetryPolicy};
//!
//! let mut host = MessagingHost::from_config(broker, &config);
//! host.register_queue(Queue::new("emails").with_retry_policy(RetryPolicy::default()))?
//!     .register_topic("emails", Topic::new("booking-created"))?
//!     .register_message_handler("emails", Arc::new(SendConfirmationEmail))?;
//! host.start().await?;
//!
//! host.publisher()
//!     .publish(&booking, &Topic::new("booking-created"), &Queue::new("emails"), Identity::new(), true)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dispatch;

/// Registration surface and worker lifecycle
pub mod host;

/// Prometheus metrics for observability
pub mod metrics;

/// Idempotent provisioning of topics, queues and subscriptions
pub mod provisioning;

/// Publishing with lazy provisioning
pub mod publisher;

/// Cooperative shutdown
pub mod shutdown;

/// Queue poll loop
pub mod worker;

pub use dispatch::{FAILURE_REASON, RETRY_ATTEMPTS};
pub use host::{HostError, MessagingHost};
pub use provisioning::{Binding, Provisioning, ProvisioningError, QueueService, TopicService};
pub use publisher::{BoundPublisher, PublishError, Publisher, PublisherRegistry};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use worker::{QueueWorker, QueueWorkerBuilder, WorkerState, WorkerStatus};
