//! Broker abstraction over a queue/topic service.
//!
//! The [`Broker`] trait is the primitive surface of an SQS/SNS-style service:
//! topics fan out to subscribed queues, queues hand out messages under a
//! visibility timeout, and a receipt handle identifies each in-flight delivery.
//!
//! ```text
//!  publish ──► Topic ──┬──► Queue A ──► receive ──► delete
//!                      └──► Queue B ──► receive ──► delete
//!  send_message ───────────►┘
//! ```
//!
//! # Idempotency
//!
//! `create_topic`, `create_queue` and `subscribe` must succeed when the
//! resource already exists and return its handle. "Already exists" is never
//! an error at this layer.
//!
//! # Implementations
//!
//! - `SqsBroker` (courier-sqs) - AWS SQS + SNS, or any compatible endpoint
//! - `InMemoryBroker` (courier-testing) - for tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of `async fn` so the broker
//! can be shared as `Arc<dyn Broker>` between publishers and workers.

use crate::message::MessageAttributes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to or configure the broker client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The named resource does not exist
    #[error("Resource not found: {resource}")]
    NotFound {
        /// Name or address of the missing resource
        resource: String,
    },

    /// The broker refused the operation
    #[error("{operation} rejected: {reason}")]
    Rejected {
        /// Broker operation (e.g. `CreateQueue`)
        operation: String,
        /// Reason reported by the broker
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload or attribute could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Shorthand for [`BrokerError::Rejected`].
    #[must_use]
    pub fn rejected(operation: &str, reason: impl std::fmt::Display) -> Self {
        Self::Rejected {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Boxed future returned by [`Broker`] methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// A provisioned topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicHandle {
    /// Physical topic name
    pub name: String,
    /// Broker address of the topic (ARN)
    pub arn: String,
}

/// A provisioned queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    /// Physical queue name
    pub name: String,
    /// Address used for send/receive/delete (queue URL)
    pub url: String,
    /// Address used by subscriptions and redrive policies (ARN)
    pub arn: String,
}

/// A topic → queue subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Broker address of the subscription
    pub arn: String,
    /// Topic ARN
    pub topic_arn: String,
    /// Queue ARN
    pub queue_arn: String,
}

/// Where a queue's broker-side redrive sends poison messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    /// ARN of the dead-letter queue
    pub arn: String,
    /// Deliveries after which the broker moves the message
    pub max_receive_count: u32,
}

/// Attributes of a queue to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Physical queue name
    pub name: String,
    /// Whether the queue is FIFO
    pub fifo: bool,
    /// Default visibility timeout, if overriding the broker default
    pub visibility_timeout: Option<Duration>,
    /// Broker-side redrive target
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueSpec {
    /// A standard queue with broker defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fifo: false,
            visibility_timeout: None,
            dead_letter: None,
        }
    }
}

/// A message to publish or send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboundMessage {
    /// Wire body
    pub body: String,
    /// String attributes
    pub attributes: MessageAttributes,
    /// Delay before the message becomes visible (queues only)
    pub delay: Duration,
    /// FIFO message group
    pub group_id: Option<String>,
    /// FIFO deduplication id
    pub deduplication_id: Option<String>,
}

/// Parameters of a receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on messages returned
    pub max_messages: u32,
    /// Long-poll wait
    pub wait_time: Duration,
    /// How long received messages stay hidden from other receivers
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(600),
        }
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Broker-assigned message id
    pub message_id: String,
    /// Token identifying this delivery
    pub receipt_handle: String,
    /// Wire body
    pub body: String,
    /// String attributes
    pub attributes: MessageAttributes,
    /// Deliveries of this message so far, including this one
    pub receive_count: u32,
}

/// Trait for queue/topic broker implementations.
///
/// All implementations must be `Send + Sync`; one broker is shared by every
/// publisher and worker in the process.
pub trait Broker: Send + Sync {
    /// Create a topic, or return the existing one with that name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker rejects the request.
    fn create_topic(&self, name: &str, fifo: bool) -> BrokerFuture<'_, TopicHandle>;

    /// List every topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the listing fails.
    fn list_topics(&self) -> BrokerFuture<'_, Vec<TopicHandle>>;

    /// Create a queue, or return the existing one with that name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker rejects the request.
    fn create_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, QueueHandle>;

    /// Look up a queue by physical name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] on transport failure. A missing queue is `Ok(None)`.
    fn find_queue(&self, name: &str) -> BrokerFuture<'_, Option<QueueHandle>>;

    /// Names of queues starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the listing fails.
    fn list_queues(&self, prefix: &str) -> BrokerFuture<'_, Vec<String>>;

    /// Subscribe a queue to a topic, or return the existing subscription.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker rejects the request.
    fn subscribe(
        &self,
        topic: &TopicHandle,
        queue: &QueueHandle,
    ) -> BrokerFuture<'_, SubscriptionHandle>;

    /// Publish to a topic. Returns the broker-assigned message id.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the publish fails.
    fn publish(&self, topic: &TopicHandle, message: OutboundMessage) -> BrokerFuture<'_, String>;

    /// Send directly to a queue. Returns the broker-assigned message id.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the send fails.
    fn send_message(&self, queue: &QueueHandle, message: OutboundMessage)
    -> BrokerFuture<'_, String>;

    /// Long-poll a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the receive fails.
    fn receive_messages(
        &self,
        queue: &QueueHandle,
        options: ReceiveOptions,
    ) -> BrokerFuture<'_, Vec<ReceivedMessage>>;

    /// Delete an in-flight message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the receipt handle is unknown or expired.
    fn delete_message(&self, queue: &QueueHandle, receipt_handle: &str) -> BrokerFuture<'_, ()>;

    /// Reset the visibility timeout of an in-flight message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the receipt handle is unknown or expired.
    fn change_message_visibility(
        &self,
        queue: &QueueHandle,
        receipt_handle: &str,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()>;
}
