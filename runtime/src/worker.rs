//! Long-running poll loop for one queue.
//!
//! # Pattern: Receive-Dispatch Loop
//!
//! ```text
//! loop {
//!     if shutdown: break
//!     receive up to N messages (long poll, raced against shutdown)
//!     dispatch the batch, at most N at a time
//!     on error: log, pause, continue
//! }
//! ```
//!
//! Nothing a handler or the broker does ends the loop; only shutdown does.

use crate::dispatch::Dispatcher;
use crate::metrics::ConsumerMetrics;
use crate::shutdown::ShutdownSignal;
use courier_core::broker::{Broker, BrokerError, QueueHandle, ReceiveOptions};
use courier_core::config::ConsumerConfig;
use courier_core::handler::{ErrorHandler, MessageHandler, Middleware};
use courier_core::resource::Queue;
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tracing::{error, info};

/// Health of a worker or of the whole host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Polling normally
    Healthy,
    /// The last poll cycle failed
    Unhealthy,
    /// Not running
    Idle,
}

const IDLE: u8 = 0;
const HEALTHY: u8 = 1;
const UNHEALTHY: u8 = 2;

/// Live status shared between a worker and its host.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    state: AtomicU8,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerStatus {
    /// Status of a worker that has not started.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::SeqCst) {
            HEALTHY => WorkerState::Healthy,
            UNHEALTHY => WorkerState::Unhealthy,
            _ => WorkerState::Idle,
        }
    }

    /// Handler invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set(&self, state: WorkerState) {
        let value = match state {
            WorkerState::Healthy => HEALTHY,
            WorkerState::Unhealthy => UNHEALTHY,
            WorkerState::Idle => IDLE,
        };
        self.state.store(value, Ordering::SeqCst);
    }
}

/// Consumes one queue until shutdown.
pub struct QueueWorker {
    dispatcher: Arc<Dispatcher>,
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    shutdown: ShutdownSignal,
    status: Arc<WorkerStatus>,
}

impl QueueWorker {
    /// Start building a worker for a provisioned queue.
    #[must_use]
    pub fn builder(broker: Arc<dyn Broker>, queue: Queue, handle: QueueHandle) -> QueueWorkerBuilder {
        QueueWorkerBuilder {
            broker,
            queue,
            handle,
            dead_letter: None,
            handlers: Vec::new(),
            error_handlers: Vec::new(),
            middleware: Vec::new(),
            config: ConsumerConfig::default(),
            shutdown: None,
            status: None,
        }
    }

    /// Shared status of this worker.
    #[must_use]
    pub fn status(&self) -> Arc<WorkerStatus> {
        Arc::clone(&self.status)
    }

    /// Spawn the loop as a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the loop until shutdown.
    pub async fn run(self) {
        let queue = self.dispatcher.handle.name.clone();
        info!(
            queue = %queue,
            max_concurrency = self.config.max_concurrency,
            "Queue worker started"
        );
        self.status.set(WorkerState::Healthy);

        while !self.shutdown.is_shutdown() {
            let failure = match AssertUnwindSafe(self.poll_once()).catch_unwind().await {
                Ok(Ok(_)) => {
                    self.status.set(WorkerState::Healthy);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "poll cycle panicked".to_string(),
            };

            ConsumerMetrics::record_receive_error(&queue);
            self.status.set(WorkerState::Unhealthy);
            error!(
                queue = %queue,
                error = %failure,
                "Failed to poll queue, retrying in {:?}",
                self.config.error_pause
            );
            if !self.shutdown.sleep(self.config.error_pause).await {
                break;
            }
        }

        self.status.set(WorkerState::Idle);
        info!(queue = %queue, "Queue worker stopped");
    }

    /// One receive-and-dispatch cycle. Returns the number of messages received.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the receive fails.
    pub async fn poll_once(&self) -> Result<usize, BrokerError> {
        let options = ReceiveOptions {
            max_messages: u32::try_from(self.config.max_concurrency).unwrap_or(u32::MAX),
            wait_time: self.config.wait_time,
            visibility_timeout: self.config.visibility_timeout,
        };

        let received = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Ok(0),
            result = self.broker.receive_messages(&self.dispatcher.handle, options) => result?,
        };

        let count = received.len();
        if count == 0 {
            return Ok(0);
        }
        ConsumerMetrics::record_received(&self.dispatcher.handle.name, count);
        tracing::debug!(queue = %self.dispatcher.handle.name, count, "Received messages");

        futures::stream::iter(received)
            .for_each_concurrent(self.config.max_concurrency, |message| async move {
                self.dispatcher.dispatch(message, &self.shutdown).await;
            })
            .await;

        Ok(count)
    }
}

/// Builder for a [`QueueWorker`].
pub struct QueueWorkerBuilder {
    broker: Arc<dyn Broker>,
    queue: Queue,
    handle: QueueHandle,
    dead_letter: Option<QueueHandle>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
    config: ConsumerConfig,
    shutdown: Option<ShutdownSignal>,
    status: Option<Arc<WorkerStatus>>,
}

impl QueueWorkerBuilder {
    /// Dead-letter queue for failed messages.
    #[must_use]
    pub fn dead_letter(mut self, handle: Option<QueueHandle>) -> Self {
        self.dead_letter = handle;
        self
    }

    /// Add a message handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add message handlers.
    #[must_use]
    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn MessageHandler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Add error handlers.
    #[must_use]
    pub fn error_handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn ErrorHandler>>) -> Self {
        self.error_handlers.extend(handlers);
        self
    }

    /// Add middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    /// Consumer settings (default: [`ConsumerConfig::default`]).
    #[must_use]
    pub const fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shutdown signal (default: never).
    #[must_use]
    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Share an existing status instead of creating one.
    #[must_use]
    pub fn status(mut self, status: Arc<WorkerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the worker.
    #[must_use]
    pub fn build(self) -> QueueWorker {
        let status = self.status.unwrap_or_default();
        let dispatcher = Dispatcher {
            queue: self.queue,
            handle: self.handle,
            dead_letter: self.dead_letter,
            broker: Arc::clone(&self.broker),
            handlers: self.handlers,
            error_handlers: self.error_handlers,
            middleware: self.middleware,
            visibility_timeout: self.config.visibility_timeout,
            in_flight: Arc::clone(&status.in_flight),
        };
        QueueWorker {
            dispatcher: Arc::new(dispatcher),
            broker: self.broker,
            config: self.config,
            shutdown: self.shutdown.unwrap_or_else(ShutdownSignal::never),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use courier_core::broker::OutboundMessage;
    use courier_testing::handlers::Recording;
    use courier_testing::{BrokerFailure, InMemoryBroker};
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryBroker>, QueueHandle) {
        let broker = Arc::new(InMemoryBroker::new());
        let handle = broker.create_queue_named("q");
        (broker, handle)
    }

    async fn send(broker: &InMemoryBroker, handle: &QueueHandle, n: usize) {
        for i in 0..n {
            broker
                .send_message(
                    handle,
                    OutboundMessage {
                        body: format!("{{\"n\":{i}}}"),
                        ..OutboundMessage::default()
                    },
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_once_dispatches_batch() {
        let (broker, handle) = setup();
        send(&broker, &handle, 3).await;
        let recording = Arc::new(Recording::new());
        let worker = QueueWorker::builder(broker.clone(), Queue::new("q"), handle)
            .handler(recording.clone())
            .build();

        let count = worker.poll_once().await.unwrap();

        assert_eq!(count, 3);
        assert_eq!(recording.count(), 3);
        assert_eq!(broker.pending("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_failure_marks_unhealthy_and_recovers() {
        let (broker, handle) = setup();
        broker.fail_next(BrokerFailure::Receive);
        send(&broker, &handle, 1).await;
        let recording = Arc::new(Recording::new());
        let shutdown = Shutdown::new();
        let worker = QueueWorker::builder(broker.clone(), Queue::new("q"), handle)
            .handler(recording.clone())
            .config(ConsumerConfig::default().with_error_pause(Duration::from_secs(5)))
            .shutdown(shutdown.signal())
            .build();
        let status = worker.status();
        let task = worker.spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.state(), WorkerState::Unhealthy);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recording.count(), 1);
        assert_eq!(status.state(), WorkerState::Healthy);

        shutdown.trigger();
        task.await.unwrap();
        assert_eq!(status.state(), WorkerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_idle_long_poll() {
        let (broker, handle) = setup();
        let shutdown = Shutdown::new();
        let worker = QueueWorker::builder(broker, Queue::new("q"), handle)
            .handler(Arc::new(Recording::new()))
            .shutdown(shutdown.signal())
            .build();
        let task = worker.spawn();

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
