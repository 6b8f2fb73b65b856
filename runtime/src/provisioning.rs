//! Idempotent provisioning of topics, queues and subscriptions.
//!
//! [`TopicService`] and [`QueueService`] turn descriptors into broker
//! resources. Both remember what they created, so repeated calls for the same
//! name cost nothing, and both rely on the broker's create operations being
//! idempotent so a restarted process converges on the same resources.
//!
//! Failures other than "already exists" surface as [`ProvisioningError`]
//! carrying the resource name. Callers must not swallow them: nothing can be
//! published to or consumed from an unprovisioned resource.

use courier_core::broker::{
    Broker, BrokerError, DeadLetterTarget, QueueHandle, QueueSpec, SubscriptionHandle, TopicHandle,
};
use courier_core::resource::{Namespace, Queue, Topic};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Broker deliveries after which a poison message moves to the DLQ on its own.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 10;

/// Errors raised while provisioning broker resources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// Topic creation or lookup failed
    #[error("Failed to provision topic '{name}': {source}")]
    Topic {
        /// Physical topic name
        name: String,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },

    /// Queue creation or lookup failed
    #[error("Failed to provision queue '{name}': {source}")]
    Queue {
        /// Physical queue name
        name: String,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },

    /// Subscribing a queue to a topic failed
    #[error("Failed to subscribe queue '{queue}' to topic '{topic}': {source}")]
    Subscription {
        /// Physical topic name
        topic: String,
        /// Physical queue name
        queue: String,
        /// Underlying broker error
        #[source]
        source: BrokerError,
    },
}

impl ProvisioningError {
    /// Name of the resource that failed.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Topic { name, .. } | Self::Queue { name, .. } => name,
            Self::Subscription { queue, .. } => queue,
        }
    }
}

/// Creates and looks up topics.
pub struct TopicService {
    broker: Arc<dyn Broker>,
    namespace: Namespace,
    registered: RwLock<HashMap<String, TopicHandle>>,
}

impl TopicService {
    /// Create a topic service.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, namespace: Namespace) -> Self {
        Self {
            broker,
            namespace,
            registered: RwLock::new(HashMap::new()),
        }
    }

    /// Create the topic, or return the existing one.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Topic`] if the broker rejects the request.
    pub async fn create_topic(&self, topic: &Topic) -> Result<TopicHandle, ProvisioningError> {
        let name = self.namespace.topic_name(topic);
        if let Some(handle) = self.cached(&name) {
            return Ok(handle);
        }

        let handle = self
            .broker
            .create_topic(&name, topic.is_fifo())
            .await
            .map_err(|source| {
                tracing::error!(topic = %name, error = %source, "Failed to provision topic");
                ProvisioningError::Topic {
                    name: name.clone(),
                    source,
                }
            })?;

        tracing::info!(topic = %name, arn = %handle.arn, "Topic provisioned");
        self.remember(handle.clone());
        Ok(handle)
    }

    /// Whether a topic with this logical name exists.
    ///
    /// Checks topics this service has seen first, then asks the broker.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Topic`] if the broker listing fails.
    pub async fn is_registered(&self, name: &str) -> Result<bool, ProvisioningError> {
        let physical = self.namespace.topic_name(&Topic::new(name));
        if self.cached(&physical).is_some() {
            return Ok(true);
        }

        let topics = self
            .broker
            .list_topics()
            .await
            .map_err(|source| ProvisioningError::Topic {
                name: physical.clone(),
                source,
            })?;

        match topics.into_iter().find(|handle| handle.name == physical) {
            Some(handle) => {
                self.remember(handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The namespace applied to topic names.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn cached(&self, name: &str) -> Option<TopicHandle> {
        self.registered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remember(&self, handle: TopicHandle) {
        self.registered
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.name.clone(), handle);
    }
}

/// Creates and looks up queues, their dead-letter queues and subscriptions.
pub struct QueueService {
    broker: Arc<dyn Broker>,
    namespace: Namespace,
    visibility_timeout: Option<Duration>,
    max_receive_count: u32,
    registered: RwLock<HashMap<String, QueueHandle>>,
    subscriptions: RwLock<HashMap<(String, String), SubscriptionHandle>>,
}

impl QueueService {
    /// Create a queue service.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, namespace: Namespace) -> Self {
        Self {
            broker,
            namespace,
            visibility_timeout: None,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            registered: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Default visibility timeout set on created queues.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Broker deliveries before the broker itself dead-letters a message.
    #[must_use]
    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count.max(1);
        self
    }

    /// Create the queue (and its dead-letter queue when enabled), or return
    /// the existing one.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Queue`] if the broker rejects either queue.
    pub async fn create_queue(&self, queue: &Queue) -> Result<QueueHandle, ProvisioningError> {
        let name = self.namespace.queue_name(queue);
        if let Some(handle) = self.cached(&name) {
            return Ok(handle);
        }

        let dead_letter = if queue.enable_dlq() {
            let dlq = self.create_dead_letter_queue(queue).await?;
            Some(DeadLetterTarget {
                arn: dlq.arn,
                max_receive_count: self.max_receive_count,
            })
        } else {
            None
        };

        let spec = QueueSpec {
            name: name.clone(),
            fifo: queue.is_fifo(),
            visibility_timeout: self.visibility_timeout,
            dead_letter,
        };
        let handle = self.create(&spec).await?;
        tracing::info!(
            queue = %name,
            url = %handle.url,
            fifo = queue.is_fifo(),
            dead_letter = queue.enable_dlq(),
            "Queue provisioned"
        );
        Ok(handle)
    }

    /// Handle of the queue's dead-letter queue, provisioning it if needed.
    ///
    /// Returns `None` when the queue has dead-lettering disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Queue`] if the broker rejects the request.
    pub async fn dead_letter_queue(
        &self,
        queue: &Queue,
    ) -> Result<Option<QueueHandle>, ProvisioningError> {
        if !queue.enable_dlq() {
            return Ok(None);
        }
        self.create_dead_letter_queue(queue).await.map(Some)
    }

    /// Subscribe a queue to a topic, or return the existing subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Subscription`] if the broker rejects the request.
    pub async fn subscribe(
        &self,
        queue: &QueueHandle,
        topic: &TopicHandle,
    ) -> Result<SubscriptionHandle, ProvisioningError> {
        let key = (topic.arn.clone(), queue.arn.clone());
        if let Some(subscription) = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(subscription.clone());
        }

        let subscription = self.broker.subscribe(topic, queue).await.map_err(|source| {
            tracing::error!(
                topic = %topic.name,
                queue = %queue.name,
                error = %source,
                "Failed to subscribe queue to topic"
            );
            ProvisioningError::Subscription {
                topic: topic.name.clone(),
                queue: queue.name.clone(),
                source,
            }
        })?;

        tracing::info!(topic = %topic.name, queue = %queue.name, "Queue subscribed to topic");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, subscription.clone());
        Ok(subscription)
    }

    /// Whether a queue with this logical name exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Queue`] if the broker lookup fails.
    pub async fn is_registered(&self, name: &str) -> Result<bool, ProvisioningError> {
        let physical = self.namespace.queue_name(&Queue::new(name));
        if self.cached(&physical).is_some() {
            return Ok(true);
        }

        let found = self
            .broker
            .find_queue(&physical)
            .await
            .map_err(|source| ProvisioningError::Queue {
                name: physical.clone(),
                source,
            })?;

        Ok(found.is_some_and(|handle| {
            self.remember(handle);
            true
        }))
    }

    /// The namespace applied to queue names.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn create_dead_letter_queue(&self, queue: &Queue) -> Result<QueueHandle, ProvisioningError> {
        let name = self.namespace.dead_letter_name(queue);
        if let Some(handle) = self.cached(&name) {
            return Ok(handle);
        }
        let spec = QueueSpec {
            name,
            fifo: queue.is_fifo(),
            visibility_timeout: self.visibility_timeout,
            dead_letter: None,
        };
        let handle = self.create(&spec).await?;
        tracing::info!(queue = %handle.name, "Dead-letter queue provisioned");
        Ok(handle)
    }

    async fn create(&self, spec: &QueueSpec) -> Result<QueueHandle, ProvisioningError> {
        let handle = self.broker.create_queue(spec).await.map_err(|source| {
            tracing::error!(queue = %spec.name, error = %source, "Failed to provision queue");
            ProvisioningError::Queue {
                name: spec.name.clone(),
                source,
            }
        })?;
        self.remember(handle.clone());
        Ok(handle)
    }

    fn cached(&self, name: &str) -> Option<QueueHandle> {
        self.registered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remember(&self, handle: QueueHandle) {
        self.registered
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.name.clone(), handle);
    }
}

/// A provisioned (topic, queue) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// The topic
    pub topic: TopicHandle,
    /// The queue subscribed to it
    pub queue: QueueHandle,
    /// The subscription between them
    pub subscription: SubscriptionHandle,
}

/// Topic and queue services sharing one broker and namespace.
pub struct Provisioning {
    topics: TopicService,
    queues: QueueService,
}

impl Provisioning {
    /// Provisioning with default queue settings.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, namespace: Namespace) -> Self {
        Self {
            topics: TopicService::new(Arc::clone(&broker), namespace.clone()),
            queues: QueueService::new(broker, namespace),
        }
    }

    /// Provisioning from pre-configured services.
    #[must_use]
    pub const fn from_services(topics: TopicService, queues: QueueService) -> Self {
        Self { topics, queues }
    }

    /// The topic service.
    #[must_use]
    pub const fn topics(&self) -> &TopicService {
        &self.topics
    }

    /// The queue service.
    #[must_use]
    pub const fn queues(&self) -> &QueueService {
        &self.queues
    }

    /// Provision the topic, the queue, and the subscription between them.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProvisioningError`] encountered.
    pub async fn provision(&self, topic: &Topic, queue: &Queue) -> Result<Binding, ProvisioningError> {
        let topic_handle = self.topics.create_topic(topic).await?;
        let queue_handle = self.queues.create_queue(queue).await?;
        let subscription = self.queues.subscribe(&queue_handle, &topic_handle).await?;
        Ok(Binding {
            topic: topic_handle,
            queue: queue_handle,
            subscription,
        })
    }
}
