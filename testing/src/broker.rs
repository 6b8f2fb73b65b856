//! In-memory broker for fast, deterministic tests.
//!
//! Models the parts of SQS/SNS the consumer loop depends on:
//! - topic fan-out to subscribed queues
//! - delivery delay and visibility timeouts (on tokio time, so paused-clock
//!   tests control them)
//! - receipt handles that change on every delivery
//! - broker-side redrive after `max_receive_count` deliveries
//!
//! Every call is counted, and one-shot failures can be injected with
//! [`InMemoryBroker::fail_next`].

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use courier_core::broker::{
    Broker, BrokerError, BrokerFuture, DeadLetterTarget, OutboundMessage, QueueHandle, QueueSpec,
    ReceiveOptions, ReceivedMessage, SubscriptionHandle, TopicHandle,
};
use courier_core::message::MessageAttributes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

const ACCOUNT: &str = "000000000000";
const REGION: &str = "us-east-1";

/// Broker operation that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerFailure {
    /// `create_topic`
    CreateTopic,
    /// `create_queue`
    CreateQueue,
    /// `subscribe`
    Subscribe,
    /// `publish`
    Publish,
    /// `send_message`
    SendMessage,
    /// `receive_messages`
    Receive,
    /// `delete_message`
    Delete,
    /// `change_message_visibility`
    ChangeVisibility,
}

/// Snapshot of how often each operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `create_topic` calls
    pub create_topic: usize,
    /// `create_queue` calls
    pub create_queue: usize,
    /// `subscribe` calls
    pub subscribe: usize,
    /// `publish` calls
    pub publish: usize,
    /// `send_message` calls
    pub send_message: usize,
    /// `receive_messages` calls
    pub receive: usize,
    /// `delete_message` calls
    pub delete: usize,
    /// `change_message_visibility` calls
    pub change_visibility: usize,
}

#[derive(Default)]
struct Counters {
    create_topic: AtomicUsize,
    create_queue: AtomicUsize,
    subscribe: AtomicUsize,
    publish: AtomicUsize,
    send_message: AtomicUsize,
    receive: AtomicUsize,
    delete: AtomicUsize,
    change_visibility: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> CallCounts {
        CallCounts {
            create_topic: self.create_topic.load(Ordering::SeqCst),
            create_queue: self.create_queue.load(Ordering::SeqCst),
            subscribe: self.subscribe.load(Ordering::SeqCst),
            publish: self.publish.load(Ordering::SeqCst),
            send_message: self.send_message.load(Ordering::SeqCst),
            receive: self.receive.load(Ordering::SeqCst),
            delete: self.delete.load(Ordering::SeqCst),
            change_visibility: self.change_visibility.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    body: String,
    attributes: MessageAttributes,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

struct QueueState {
    handle: QueueHandle,
    dead_letter: Option<DeadLetterTarget>,
    messages: Vec<Stored>,
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, TopicHandle>,
    queues: BTreeMap<String, QueueState>,
    subscriptions: Vec<SubscriptionHandle>,
    failures: Vec<BrokerFailure>,
    deleted: usize,
}

impl State {
    fn take_failure(&mut self, operation: BrokerFailure) -> Result<(), BrokerError> {
        match self.failures.iter().position(|f| *f == operation) {
            Some(index) => {
                self.failures.remove(index);
                Err(BrokerError::Transport(format!("injected {operation:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState, BrokerError> {
        self.queues.get_mut(name).ok_or_else(|| BrokerError::NotFound {
            resource: name.to_string(),
        })
    }

    fn queue_name_by_arn(&self, arn: &str) -> Option<String> {
        self.queues
            .values()
            .find(|queue| queue.handle.arn == arn)
            .map(|queue| queue.handle.name.clone())
    }

    fn enqueue(&mut self, queue: &str, message: OutboundMessage) -> Result<String, BrokerError> {
        let message_id = Uuid::new_v4().to_string();
        self.queue_mut(queue)?.messages.push(Stored {
            message_id: message_id.clone(),
            body: message.body,
            attributes: message.attributes,
            visible_at: Instant::now() + message.delay,
            receipt: None,
            receive_count: 0,
        });
        Ok(message_id)
    }

    fn insert_queue(&mut self, spec: &QueueSpec) -> QueueHandle {
        let queue = self.queues.entry(spec.name.clone()).or_insert_with(|| QueueState {
            handle: QueueHandle {
                name: spec.name.clone(),
                url: format!("memory://{REGION}/{ACCOUNT}/{}", spec.name),
                arn: format!("arn:aws:sqs:{REGION}:{ACCOUNT}:{}", spec.name),
            },
            dead_letter: None,
            messages: Vec::new(),
        });
        if spec.dead_letter.is_some() {
            queue.dead_letter.clone_from(&spec.dead_letter);
        }
        queue.handle.clone()
    }

    /// Hand out visible messages, applying redrive. Also returns when the
    /// next hidden message becomes visible.
    fn take_visible(
        &mut self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>), BrokerError> {
        let now = Instant::now();
        let max = usize::try_from(options.max_messages.max(1)).unwrap_or(usize::MAX);
        let state = self.queue_mut(queue)?;
        let redrive = state.dead_letter.clone();

        let mut batch = Vec::new();
        let mut redriven = Vec::new();
        let mut index = 0;
        while index < state.messages.len() && batch.len() < max {
            let message = &mut state.messages[index];
            if message.visible_at > now {
                index += 1;
                continue;
            }
            if let Some(target) = &redrive {
                if message.receive_count >= target.max_receive_count {
                    redriven.push(state.messages.remove(index));
                    continue;
                }
            }
            let receipt = Uuid::new_v4().to_string();
            message.receipt = Some(receipt.clone());
            message.receive_count += 1;
            message.visible_at = now + options.visibility_timeout;
            batch.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                receipt_handle: receipt,
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                receive_count: message.receive_count,
            });
            index += 1;
        }
        let next_visible = state
            .messages
            .iter()
            .map(|message| message.visible_at)
            .filter(|at| *at > now)
            .min();

        if let Some(target) = redrive {
            if let Some(dlq) = self.queue_name_by_arn(&target.arn) {
                if let Ok(dlq) = self.queue_mut(&dlq) {
                    for mut message in redriven {
                        message.receipt = None;
                        message.visible_at = now;
                        dlq.messages.push(message);
                    }
                }
            }
        }

        Ok((batch, next_visible))
    }
}

/// In-memory [`Broker`].
///
/// # Example
///
/// ```
/// use courier_core::broker::{Broker, OutboundMessage, ReceiveOptions};
/// use courier_testing::InMemoryBroker;
///
/// # tokio_test::block_on(async {
/// let broker = InMemoryBroker::new();
/// let queue = broker.create_queue_named("jobs");
/// broker.send_message(&queue, OutboundMessage { body: "{}".into(), ..Default::default() }).await.unwrap();
///
/// let received = broker.receive_messages(&queue, ReceiveOptions::default()).await.unwrap();
/// assert_eq!(received.len(), 1);
/// assert_eq!(broker.calls().send_message, 1);
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
    counters: Counters,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail with a transport error.
    ///
    /// Calling this twice queues two failures.
    pub fn fail_next(&self, operation: BrokerFailure) {
        self.state.lock().unwrap().failures.push(operation);
    }

    /// Create a standard queue without counting the call or consulting
    /// injected failures.
    pub fn create_queue_named(&self, name: &str) -> QueueHandle {
        self.state.lock().unwrap().insert_queue(&QueueSpec::new(name))
    }

    /// How often each operation was called.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.counters.snapshot()
    }

    /// Physical names of every topic, sorted.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.state.lock().unwrap().topics.keys().cloned().collect()
    }

    /// Physical names of every queue, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().unwrap().queues.keys().cloned().collect()
    }

    /// Number of distinct subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    /// Messages held by a queue, visible or not.
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Messages a receive would return right now.
    #[must_use]
    pub fn visible(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.state.lock().unwrap().queues.get(queue).map_or(0, |queue| {
            queue.messages.iter().filter(|m| m.visible_at <= now).count()
        })
    }

    /// Copies of a queue's messages without changing their visibility.
    #[must_use]
    pub fn peek(&self, queue: &str) -> Vec<ReceivedMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|queue| {
                queue
                    .messages
                    .iter()
                    .map(|m| ReceivedMessage {
                        message_id: m.message_id.clone(),
                        receipt_handle: m.receipt.clone().unwrap_or_default(),
                        body: m.body.clone(),
                        attributes: m.attributes.clone(),
                        receive_count: m.receive_count,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Successful deletes so far.
    #[must_use]
    pub fn deleted(&self) -> usize {
        self.state.lock().unwrap().deleted
    }

    fn fail_or<T>(
        &self,
        operation: BrokerFailure,
        counter: &AtomicUsize,
        f: impl FnOnce(&mut State) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        Counters::bump(counter);
        let mut state = self.state.lock().unwrap();
        state.take_failure(operation)?;
        f(&mut state)
    }
}

impl Broker for InMemoryBroker {
    fn create_topic(&self, name: &str, _fifo: bool) -> BrokerFuture<'_, TopicHandle> {
        let name = name.to_string();
        Box::pin(async move {
            self.fail_or(BrokerFailure::CreateTopic, &self.counters.create_topic, |state| {
                Ok(state
                    .topics
                    .entry(name.clone())
                    .or_insert_with(|| TopicHandle {
                        arn: format!("arn:aws:sns:{REGION}:{ACCOUNT}:{name}"),
                        name: name.clone(),
                    })
                    .clone())
            })
        })
    }

    fn list_topics(&self) -> BrokerFuture<'_, Vec<TopicHandle>> {
        Box::pin(async move { Ok(self.state.lock().unwrap().topics.values().cloned().collect()) })
    }

    fn create_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, QueueHandle> {
        let spec = spec.clone();
        Box::pin(async move {
            self.fail_or(BrokerFailure::CreateQueue, &self.counters.create_queue, |state| {
                Ok(state.insert_queue(&spec))
            })
        })
    }

    fn find_queue(&self, name: &str) -> BrokerFuture<'_, Option<QueueHandle>> {
        let name = name.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .queues
                .get(&name)
                .map(|queue| queue.handle.clone()))
        })
    }

    fn list_queues(&self, prefix: &str) -> BrokerFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .queues
                .keys()
                .filter(|name| name.starts_with(&prefix))
                .cloned()
                .collect())
        })
    }

    fn subscribe(
        &self,
        topic: &TopicHandle,
        queue: &QueueHandle,
    ) -> BrokerFuture<'_, SubscriptionHandle> {
        let topic = topic.clone();
        let queue = queue.clone();
        Box::pin(async move {
            self.fail_or(BrokerFailure::Subscribe, &self.counters.subscribe, |state| {
                if !state.topics.contains_key(&topic.name) {
                    return Err(BrokerError::NotFound { resource: topic.arn });
                }
                if let Some(existing) = state
                    .subscriptions
                    .iter()
                    .find(|s| s.topic_arn == topic.arn && s.queue_arn == queue.arn)
                {
                    return Ok(existing.clone());
                }
                let subscription = SubscriptionHandle {
                    arn: format!("{}:{}", topic.arn, Uuid::new_v4()),
                    topic_arn: topic.arn,
                    queue_arn: queue.arn,
                };
                state.subscriptions.push(subscription.clone());
                Ok(subscription)
            })
        })
    }

    fn publish(&self, topic: &TopicHandle, message: OutboundMessage) -> BrokerFuture<'_, String> {
        let topic = topic.clone();
        Box::pin(async move {
            let message_id = self.fail_or(BrokerFailure::Publish, &self.counters.publish, |state| {
                if !state.topics.contains_key(&topic.name) {
                    return Err(BrokerError::NotFound { resource: topic.arn });
                }
                let targets: Vec<String> = state
                    .subscriptions
                    .iter()
                    .filter(|s| s.topic_arn == topic.arn)
                    .filter_map(|s| state.queue_name_by_arn(&s.queue_arn))
                    .collect();
                for queue in targets {
                    state.enqueue(
                        &queue,
                        OutboundMessage {
                            delay: Duration::ZERO,
                            ..message.clone()
                        },
                    )?;
                }
                Ok(Uuid::new_v4().to_string())
            })?;
            self.arrivals.notify_waiters();
            Ok(message_id)
        })
    }

    fn send_message(
        &self,
        queue: &QueueHandle,
        message: OutboundMessage,
    ) -> BrokerFuture<'_, String> {
        let queue = queue.name.clone();
        Box::pin(async move {
            let message_id = self.fail_or(BrokerFailure::SendMessage, &self.counters.send_message, |state| {
                state.enqueue(&queue, message)
            })?;
            self.arrivals.notify_waiters();
            Ok(message_id)
        })
    }

    fn receive_messages(
        &self,
        queue: &QueueHandle,
        options: ReceiveOptions,
    ) -> BrokerFuture<'_, Vec<ReceivedMessage>> {
        let queue = queue.name.clone();
        Box::pin(async move {
            Counters::bump(&self.counters.receive);
            self.state.lock().unwrap().take_failure(BrokerFailure::Receive)?;

            let deadline = Instant::now() + options.wait_time;
            loop {
                let arrival = self.arrivals.notified();
                tokio::pin!(arrival);
                arrival.as_mut().enable();

                let (batch, next_visible) = self.state.lock().unwrap().take_visible(&queue, options)?;
                if !batch.is_empty() || Instant::now() >= deadline {
                    return Ok(batch);
                }

                let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
                let _ = tokio::time::timeout_at(wake_at, arrival).await;
            }
        })
    }

    fn delete_message(&self, queue: &QueueHandle, receipt_handle: &str) -> BrokerFuture<'_, ()> {
        let queue = queue.name.clone();
        let receipt = receipt_handle.to_string();
        Box::pin(async move {
            self.fail_or(BrokerFailure::Delete, &self.counters.delete, |state| {
                let messages = &mut state.queue_mut(&queue)?.messages;
                let index = messages
                    .iter()
                    .position(|m| m.receipt.as_deref() == Some(receipt.as_str()))
                    .ok_or_else(|| BrokerError::NotFound {
                        resource: receipt.clone(),
                    })?;
                messages.remove(index);
                state.deleted += 1;
                Ok(())
            })
        })
    }

    fn change_message_visibility(
        &self,
        queue: &QueueHandle,
        receipt_handle: &str,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()> {
        let queue = queue.name.clone();
        let receipt = receipt_handle.to_string();
        Box::pin(async move {
            self.fail_or(BrokerFailure::ChangeVisibility, &self.counters.change_visibility, |state| {
                let message = state
                    .queue_mut(&queue)?
                    .messages
                    .iter_mut()
                    .find(|m| m.receipt.as_deref() == Some(receipt.as_str()))
                    .ok_or_else(|| BrokerError::NotFound {
                        resource: receipt.clone(),
                    })?;
                message.visible_at = Instant::now() + timeout;
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(text: &str) -> OutboundMessage {
        OutboundMessage {
            body: text.to_string(),
            ..OutboundMessage::default()
        }
    }

    #[tokio::test]
    async fn create_operations_are_idempotent() {
        let broker = InMemoryBroker::new();
        let t1 = broker.create_topic("t", false).await.unwrap();
        let t2 = broker.create_topic("t", false).await.unwrap();
        let q1 = broker.create_queue(&QueueSpec::new("q")).await.unwrap();
        let q2 = broker.create_queue(&QueueSpec::new("q")).await.unwrap();
        let s1 = broker.subscribe(&t1, &q1).await.unwrap();
        let s2 = broker.subscribe(&t2, &q2).await.unwrap();

        assert_eq!(t1, t2);
        assert_eq!(q1, q2);
        assert_eq!(s1, s2);
        assert_eq!(broker.subscription_count(), 1);
        assert_eq!(broker.calls().create_topic, 2);
    }

    #[tokio::test]
    async fn publish_fans_out_to_subscribed_queues() {
        let broker = InMemoryBroker::new();
        let topic = broker.create_topic("t", false).await.unwrap();
        let a = broker.create_queue_named("a");
        let b = broker.create_queue_named("b");
        broker.create_queue_named("c");
        broker.subscribe(&topic, &a).await.unwrap();
        broker.subscribe(&topic, &b).await.unwrap();

        broker.publish(&topic, body("hello")).await.unwrap();

        assert_eq!(broker.pending("a"), 1);
        assert_eq!(broker.pending("b"), 1);
        assert_eq!(broker.pending("c"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_are_hidden_until_timeout() {
        let broker = InMemoryBroker::new();
        let queue = broker.create_queue_named("q");
        broker.send_message(&queue, body("x")).await.unwrap();
        let options = ReceiveOptions {
            max_messages: 10,
            wait_time: Duration::ZERO,
            visibility_timeout: Duration::from_secs(30),
        };

        let first = broker.receive_messages(&queue, options).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(broker.receive_messages(&queue, options).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = broker.receive_messages(&queue, options).await.unwrap();
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

        // The stale receipt no longer deletes.
        assert!(broker.delete_message(&queue, &first[0].receipt_handle).await.is_err());
        broker.delete_message(&queue, &second[0].receipt_handle).await.unwrap();
        assert_eq!(broker.pending("q"), 0);
        assert_eq!(broker.deleted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_arrival() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let queue = broker.create_queue_named("q");

        let receiver = {
            let broker = std::sync::Arc::clone(&broker);
            let queue = queue.clone();
            tokio::spawn(async move { broker.receive_messages(&queue, ReceiveOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        broker.send_message(&queue, body("late")).await.unwrap();

        let received = receiver.await.unwrap().unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_returns_empty_after_wait_time() {
        let broker = InMemoryBroker::new();
        let queue = broker.create_queue_named("q");
        let started = Instant::now();

        let received = broker
            .receive_messages(&queue, ReceiveOptions::default())
            .await
            .unwrap();

        assert!(received.is_empty());
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn redrive_moves_message_after_max_receives() {
        let broker = InMemoryBroker::new();
        let dlq = broker.create_queue_named("q-dlq");
        let mut spec = QueueSpec::new("q");
        spec.dead_letter = Some(DeadLetterTarget {
            arn: dlq.arn,
            max_receive_count: 2,
        });
        let queue = broker.create_queue(&spec).await.unwrap();
        broker.send_message(&queue, body("poison")).await.unwrap();
        let options = ReceiveOptions {
            max_messages: 1,
            wait_time: Duration::ZERO,
            visibility_timeout: Duration::from_secs(1),
        };

        for _ in 0..2 {
            assert_eq!(broker.receive_messages(&queue, options).await.unwrap().len(), 1);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(broker.receive_messages(&queue, options).await.unwrap().is_empty());

        assert_eq!(broker.pending("q"), 0);
        assert_eq!(broker.peek("q-dlq")[0].body, "poison");
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let broker = InMemoryBroker::new();
        broker.fail_next(BrokerFailure::CreateTopic);

        assert!(broker.create_topic("t", false).await.is_err());
        assert!(broker.create_topic("t", false).await.is_ok());
    }
}
