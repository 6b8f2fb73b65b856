//! Publishing with lazy, single-flight provisioning.
//!
//! The first publish for a (topic, queue) pair provisions the topic, the
//! queue and the subscription; later publishes reuse the cached binding.
//! Concurrent first publishes for the same pair share one provisioning run.
//!
//! # Example
//!
//! ```rust,ignore
//! let publisher = Publisher::new(broker, provisioning);
//! let response = publisher
//!     .publish(&booking, &Topic::new("booking-created"), &Queue::new("emails"), Identity::new(), true)
//!     .await?;
//! tracing::info!(request_id = %response.request_id, "Booking announced");
//! ```

use crate::metrics::PublisherMetrics;
use crate::provisioning::{Binding, Provisioning, ProvisioningError};
use courier_core::broker::{Broker, BrokerError, OutboundMessage, QueueHandle};
use courier_core::config::PublisherConfig;
use courier_core::correlation::{CorrelationSource, TaskLocalCorrelation};
use courier_core::message::{Identity, Message, PublishResponse};
use courier_core::resource::{Queue, Topic};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Errors raised by publish calls.
#[derive(Error, Debug)]
pub enum PublishError {
    /// A resource could not be provisioned
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// The content could not be serialized
    #[error("Failed to serialize message for '{destination}': {reason}")]
    Serialization {
        /// Topic or queue name
        destination: String,
        /// Serializer error
        reason: String,
    },

    /// The broker did not accept the message
    #[error("Failed to send message to '{destination}': {source}")]
    Send {
        /// Topic or queue name
        destination: String,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },
}

type Slot<T> = Arc<OnceCell<T>>;

/// Cache of provisioned destinations, keyed by physical name.
///
/// Each key holds a cell initialized at most once; a failed initialization
/// leaves the cell empty so the next caller tries again.
#[derive(Default)]
pub struct PublisherRegistry {
    bindings: Mutex<HashMap<(String, String), Slot<Arc<Binding>>>>,
    queues: Mutex<HashMap<String, Slot<QueueHandle>>>,
}

impl PublisherRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of provisioned (topic, queue) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Whether no pair has been provisioned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the pair has been provisioned.
    #[must_use]
    pub fn contains(&self, topic: &str, queue: &str) -> bool {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(topic.to_string(), queue.to_string()))
            .is_some_and(|slot| slot.initialized())
    }

    fn binding_slot(&self, topic: String, queue: String) -> Slot<Arc<Binding>> {
        Arc::clone(
            self.bindings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry((topic, queue))
                .or_default(),
        )
    }

    fn queue_slot(&self, queue: String) -> Slot<QueueHandle> {
        Arc::clone(
            self.queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(queue)
                .or_default(),
        )
    }
}

/// Publishes messages to topics and queues.
///
/// Cheap to clone; clones share the broker, provisioning and registry.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    provisioning: Arc<Provisioning>,
    registry: Arc<PublisherRegistry>,
    correlation: Arc<dyn CorrelationSource>,
    config: PublisherConfig,
}

impl Publisher {
    /// Create a publisher continuing the task-local correlation.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, provisioning: Arc<Provisioning>) -> Self {
        Self {
            broker,
            provisioning,
            registry: Arc::new(PublisherRegistry::new()),
            correlation: Arc::new(TaskLocalCorrelation),
            config: PublisherConfig::default(),
        }
    }

    /// Use a different correlation source.
    #[must_use]
    pub fn with_correlation_source(mut self, source: Arc<dyn CorrelationSource>) -> Self {
        self.correlation = source;
        self
    }

    /// Use different publisher settings.
    #[must_use]
    pub const fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// The provisioning cache.
    #[must_use]
    pub fn registry(&self) -> &PublisherRegistry {
        &self.registry
    }

    /// Publish `content` to `topic`, making sure `queue` is subscribed to it.
    ///
    /// With `use_default_envelope` the body is the full message envelope;
    /// otherwise it is the bare content. Metadata rides in attributes either way.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if provisioning, serialization or the publish fails.
    pub async fn publish<T>(
        &self,
        content: &T,
        topic: &Topic,
        queue: &Queue,
        identity: Identity,
        use_default_envelope: bool,
    ) -> Result<PublishResponse, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let binding = self.binding(topic, queue).await?;
        self.publish_bound(&binding, topic, content, identity, use_default_envelope)
            .await
    }

    /// Send `content` straight to `queue`, bypassing topics.
    ///
    /// The message becomes visible after the configured queue delivery delay.
    /// The body is always the envelope, with the queue name as its topic.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if provisioning, serialization or the send fails.
    pub async fn send_to_queue<T>(
        &self,
        content: &T,
        queue: &Queue,
        identity: Identity,
    ) -> Result<PublishResponse, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let started = Instant::now();
        let handle = self.queue_handle(queue).await?;
        let message = self.message(queue.name(), content, identity)?;
        let body = message
            .encode_body(true)
            .map_err(|e| serialization(queue.name(), &e))?;

        let outbound = OutboundMessage {
            body,
            attributes: message.attributes(),
            // FIFO queues reject per-message delays.
            delay: if queue.is_fifo() {
                Duration::ZERO
            } else {
                self.config.queue_delivery_delay
            },
            group_id: queue.is_fifo().then(|| queue.name().to_string()),
            deduplication_id: queue.is_fifo().then(|| message.id.to_string()),
        };

        let message_id = self
            .broker
            .send_message(&handle, outbound)
            .await
            .map_err(|source| {
                tracing::error!(queue = %handle.name, error = %source, "Failed to send message to queue");
                PublisherMetrics::record_publish_error(&handle.name);
                PublishError::Send {
                    destination: handle.name.clone(),
                    source,
                }
            })?;

        PublisherMetrics::record_publish(&handle.name, started.elapsed());
        tracing::debug!(
            queue = %handle.name,
            message_id = %message_id,
            request_id = %message.correlation.request_id,
            "Message sent to queue"
        );
        Ok(PublishResponse {
            request_id: message.correlation.request_id,
            message_id,
        })
    }

    /// Provision `topic` and `queue` now and return a publisher fixed to them.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Provisioning`] if provisioning fails.
    pub async fn bind(
        &self,
        topic: &Topic,
        queue: &Queue,
        use_default_envelope: bool,
    ) -> Result<BoundPublisher, PublishError> {
        let binding = self.binding(topic, queue).await?;
        Ok(BoundPublisher {
            publisher: self.clone(),
            binding,
            topic: topic.clone(),
            use_default_envelope,
        })
    }

    async fn binding(&self, topic: &Topic, queue: &Queue) -> Result<Arc<Binding>, ProvisioningError> {
        let topic_name = self.provisioning.topics().namespace().topic_name(topic);
        let queue_name = self.provisioning.queues().namespace().queue_name(queue);
        let slot = self.registry.binding_slot(topic_name, queue_name);

        let binding = slot
            .get_or_try_init(|| async {
                let binding = self.provisioning.provision(topic, queue).await?;
                PublisherMetrics::record_provisioned();
                tracing::info!(
                    topic = %binding.topic.name,
                    queue = %binding.queue.name,
                    "Publisher destination provisioned"
                );
                Ok::<_, ProvisioningError>(Arc::new(binding))
            })
            .await?;
        Ok(Arc::clone(binding))
    }

    async fn queue_handle(&self, queue: &Queue) -> Result<QueueHandle, ProvisioningError> {
        let name = self.provisioning.queues().namespace().queue_name(queue);
        let slot = self.registry.queue_slot(name);
        let handle = slot
            .get_or_try_init(|| self.provisioning.queues().create_queue(queue))
            .await?;
        Ok(handle.clone())
    }

    fn message<T>(&self, topic: &str, content: &T, identity: Identity) -> Result<Message, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let content = serde_json::to_value(content).map_err(|e| serialization(topic, &e))?;
        Ok(Message::new(topic, content, self.correlation.next(), identity))
    }

    async fn publish_bound<T>(
        &self,
        binding: &Binding,
        topic: &Topic,
        content: &T,
        identity: Identity,
        use_default_envelope: bool,
    ) -> Result<PublishResponse, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let started = Instant::now();
        let message = self.message(topic.name(), content, identity)?;
        let body = message
            .encode_body(use_default_envelope)
            .map_err(|e| serialization(topic.name(), &e))?;

        let outbound = OutboundMessage {
            body,
            attributes: message.attributes(),
            group_id: topic.is_fifo().then(|| topic.name().to_string()),
            deduplication_id: topic.is_fifo().then(|| message.id.to_string()),
            ..OutboundMessage::default()
        };

        let message_id = self
            .broker
            .publish(&binding.topic, outbound)
            .await
            .map_err(|source| {
                tracing::error!(topic = %binding.topic.name, error = %source, "Failed to publish message");
                PublisherMetrics::record_publish_error(&binding.topic.name);
                PublishError::Send {
                    destination: binding.topic.name.clone(),
                    source,
                }
            })?;

        PublisherMetrics::record_publish(&binding.topic.name, started.elapsed());
        tracing::debug!(
            topic = %binding.topic.name,
            message_id = %message_id,
            request_id = %message.correlation.request_id,
            "Message published"
        );
        Ok(PublishResponse {
            request_id: message.correlation.request_id,
            message_id,
        })
    }
}

fn serialization(destination: &str, error: &serde_json::Error) -> PublishError {
    PublishError::Serialization {
        destination: destination.to_string(),
        reason: error.to_string(),
    }
}

/// Publisher fixed to one provisioned (topic, queue) pair.
#[derive(Clone)]
pub struct BoundPublisher {
    publisher: Publisher,
    binding: Arc<Binding>,
    topic: Topic,
    use_default_envelope: bool,
}

impl BoundPublisher {
    /// Publish with an empty identity.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if serialization or the publish fails.
    pub async fn publish<T>(&self, content: &T) -> Result<PublishResponse, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_identity(content, Identity::new()).await
    }

    /// Publish with requester attributes.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if serialization or the publish fails.
    pub async fn publish_with_identity<T>(
        &self,
        content: &T,
        identity: Identity,
    ) -> Result<PublishResponse, PublishError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .publish_bound(&self.binding, &self.topic, content, identity, self.use_default_envelope)
            .await
    }

    /// The provisioned resources.
    #[must_use]
    pub fn binding(&self) -> &Binding {
        &self.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::correlation::Correlation;
    use courier_core::resource::Namespace;
    use courier_testing::{BrokerFailure, InMemoryBroker};
    use serde_json::json;

    fn publisher(broker: &Arc<InMemoryBroker>) -> Publisher {
        let broker = Arc::clone(broker) as Arc<dyn Broker>;
        let provisioning = Arc::new(Provisioning::new(Arc::clone(&broker), Namespace::none()));
        Publisher::new(broker, provisioning)
    }

    #[tokio::test]
    async fn publish_provisions_once_per_pair() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(&broker);
        let topic = Topic::new("booking-created");
        let queue = Queue::new("emails");

        for _ in 0..3 {
            publisher
                .publish(&json!({ "n": 1 }), &topic, &queue, Identity::new(), true)
                .await
                .unwrap();
        }

        let calls = broker.calls();
        assert_eq!(calls.create_topic, 1);
        assert_eq!(calls.create_queue, 1);
        assert_eq!(calls.subscribe, 1);
        assert_eq!(broker.pending("emails"), 3);
        assert!(publisher.registry().contains("booking-created", "emails"));
    }

    #[tokio::test]
    async fn concurrent_first_publishes_share_provisioning() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(&broker);
        let topic = Topic::new("t");
        let queue = Queue::new("q");

        let calls = (0..8).map(|i| {
            let publisher = publisher.clone();
            let topic = topic.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                publisher
                    .publish(&json!({ "i": i }), &topic, &queue, Identity::new(), false)
                    .await
            })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }

        assert_eq!(broker.calls().create_topic, 1);
        assert_eq!(broker.calls().subscribe, 1);
        assert_eq!(publisher.registry().len(), 1);
    }

    #[tokio::test]
    async fn failed_provisioning_is_retried_on_next_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(&broker);
        broker.fail_next(BrokerFailure::CreateTopic);

        let err = publisher
            .publish(&json!({}), &Topic::new("t"), &Queue::new("q"), Identity::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Provisioning(_)));
        assert!(publisher.registry().is_empty());

        publisher
            .publish(&json!({}), &Topic::new("t"), &Queue::new("q"), Identity::new(), true)
            .await
            .unwrap();
        assert_eq!(publisher.registry().len(), 1);
    }

    #[tokio::test]
    async fn publish_continues_current_trace() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(&broker);
        let incoming = Correlation::new();

        let response = incoming
            .scope(publisher.publish(
                &json!({}),
                &Topic::new("t"),
                &Queue::new("q"),
                Identity::new(),
                true,
            ))
            .await
            .unwrap();

        let delivered = broker.peek("q");
        let message = Message::decode(&delivered[0].body, &delivered[0].attributes);
        assert_eq!(message.correlation.trace_id, incoming.trace_id);
        assert_eq!(message.correlation.session_id, incoming.session_id);
        assert_ne!(message.correlation.span_id, incoming.span_id);
        assert_eq!(message.correlation.request_id, response.request_id);
    }

    #[tokio::test]
    async fn publish_without_scope_synthesizes_correlation() {
        let broker = Arc::new(InMemoryBroker::new());
        let response = publisher(&broker)
            .publish(&json!({}), &Topic::new("t"), &Queue::new("q"), Identity::new(), false)
            .await
            .unwrap();

        let delivered = broker.peek("q");
        let correlation = Correlation::from_attributes(&delivered[0].attributes);
        assert!(correlation.is_complete());
        assert_eq!(correlation.request_id, response.request_id);
    }

    #[tokio::test]
    async fn raw_body_carries_only_content() {
        let broker = Arc::new(InMemoryBroker::new());
        publisher(&broker)
            .publish(&json!({ "content": "A" }), &Topic::new("t"), &Queue::new("q"), Identity::new(), false)
            .await
            .unwrap();

        let delivered = broker.peek("q");
        assert_eq!(delivered[0].body, r#"{"content":"A"}"#);
        assert_eq!(
            delivered[0].attributes.get(courier_core::message::TOPIC).map(String::as_str),
            Some("t")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_queue_applies_delivery_delay() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(&broker).with_config(
            PublisherConfig::default().with_queue_delivery_delay(Duration::from_secs(5)),
        );

        publisher
            .send_to_queue(&json!({ "k": "v" }), &Queue::new("jobs"), Identity::new())
            .await
            .unwrap();

        assert_eq!(broker.visible("jobs"), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(broker.visible("jobs"), 1);
        assert_eq!(broker.calls().create_topic, 0);
    }

    #[tokio::test]
    async fn bound_publisher_reuses_binding() {
        let broker = Arc::new(InMemoryBroker::new());
        let bound = publisher(&broker)
            .bind(&Topic::new("t"), &Queue::new("q"), true)
            .await
            .unwrap();

        let mut identity = Identity::new();
        identity.insert("userId".to_string(), "7".to_string());
        bound.publish(&json!(1)).await.unwrap();
        bound.publish_with_identity(&json!(2), identity).await.unwrap();

        assert_eq!(broker.calls().create_topic, 1);
        assert_eq!(broker.pending("q"), 2);
        assert_eq!(bound.binding().queue.name, "q");
    }

    #[tokio::test]
    async fn broker_send_failure_is_reported() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(&broker);
        publisher
            .publish(&json!({}), &Topic::new("t"), &Queue::new("q"), Identity::new(), true)
            .await
            .unwrap();
        broker.fail_next(BrokerFailure::Publish);

        let err = publisher
            .publish(&json!({}), &Topic::new("t"), &Queue::new("q"), Identity::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Send { ref destination, .. } if destination == "t"));
    }
}
