//! Registration surface and lifecycle for queue workers.
//!
//! ```rust,ignore
//! let mut host = MessagingHost::from_config(broker, &config);
//! host.register_queue(Queue::new("emails").with_dead_letter_queue(true))?
//!     .register_topic("emails", Topic::new("booking-created"))?
//!     .register_message_handler("emails", Arc::new(SendConfirmationEmail::new(mailer)))?;
//! host.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! host.stop().await;
//! ```

use crate::provisioning::{Provisioning, ProvisioningError, QueueService, TopicService};
use crate::publisher::Publisher;
use crate::shutdown::Shutdown;
use crate::worker::{QueueWorker, WorkerState, WorkerStatus};
use courier_core::broker::{Broker, QueueHandle};
use courier_core::config::{Config, ConsumerConfig, PublisherConfig};
use courier_core::handler::{ErrorHandler, MessageHandler, Middleware};
use courier_core::resource::{Namespace, Queue, Topic};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors raised by the messaging host.
#[derive(Error, Debug)]
pub enum HostError {
    /// Registration or start was attempted while workers are running
    #[error("Messaging host is already started")]
    AlreadyStarted,

    /// The queue was never passed to `register_queue`
    #[error("Queue '{0}' is not registered")]
    NotRegistered(String),

    /// A queue, topic or subscription could not be provisioned
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

struct QueueRegistration {
    queue: Queue,
    topics: Vec<Topic>,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

struct RunningWorker {
    status: Arc<WorkerStatus>,
    task: JoinHandle<()>,
}

/// Owns the queue workers of a process.
pub struct MessagingHost {
    broker: Arc<dyn Broker>,
    provisioning: Arc<Provisioning>,
    consumer: ConsumerConfig,
    publisher: PublisherConfig,
    registrations: Vec<QueueRegistration>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
    shutdown: Shutdown,
    workers: Vec<RunningWorker>,
}

impl MessagingHost {
    /// Host with default consumer settings.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, provisioning: Arc<Provisioning>) -> Self {
        Self {
            broker,
            provisioning,
            consumer: ConsumerConfig::default(),
            publisher: PublisherConfig::default(),
            registrations: Vec::new(),
            error_handlers: Vec::new(),
            middleware: Vec::new(),
            shutdown: Shutdown::new(),
            workers: Vec::new(),
        }
    }

    /// Host using the namespace and settings from `config`.
    #[must_use]
    pub fn from_config(broker: Arc<dyn Broker>, config: &Config) -> Self {
        let namespace = config.namespace();
        let provisioning = Provisioning::from_services(
            TopicService::new(Arc::clone(&broker), namespace.clone()),
            QueueService::new(Arc::clone(&broker), namespace)
                .with_visibility_timeout(config.consumer.visibility_timeout),
        );
        let mut host = Self::new(broker, Arc::new(provisioning));
        host.consumer = config.consumer;
        host.publisher = config.publisher;
        host
    }

    /// Host without a namespace.
    #[must_use]
    pub fn with_broker(broker: Arc<dyn Broker>) -> Self {
        let provisioning = Arc::new(Provisioning::new(Arc::clone(&broker), Namespace::none()));
        Self::new(broker, provisioning)
    }

    /// Override consumer settings.
    #[must_use]
    pub const fn with_consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer = config;
        self
    }

    /// A publisher sharing this host's broker and provisioning.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.broker), Arc::clone(&self.provisioning)).with_config(self.publisher)
    }

    /// Handle that can stop the workers from elsewhere (e.g. a signal task).
    ///
    /// The handle stays valid across [`start`](Self::start) and
    /// [`stop`](Self::stop). Triggering it before `start` makes the next
    /// run's workers exit at once.
    #[must_use]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Register a queue to consume. Registering the same name again replaces
    /// its settings and keeps its topics and handlers.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::AlreadyStarted`] while workers are running.
    pub fn register_queue(&mut self, queue: Queue) -> Result<&mut Self, HostError> {
        self.ensure_stopped()?;
        if let Some(existing) = self.registrations.iter_mut().find(|r| r.queue == queue) {
            existing.queue = queue;
        } else {
            self.registrations.push(QueueRegistration {
                queue,
                topics: Vec::new(),
                handlers: Vec::new(),
            });
        }
        Ok(self)
    }

    /// Subscribe a registered queue to a topic at start.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the host is running or the queue is unknown.
    pub fn register_topic(&mut self, queue: &str, topic: Topic) -> Result<&mut Self, HostError> {
        let registration = self.registration(queue)?;
        if !registration.topics.contains(&topic) {
            registration.topics.push(topic);
        }
        Ok(self)
    }

    /// Add a handler for a registered queue. Handlers run in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the host is running or the queue is unknown.
    pub fn register_message_handler(
        &mut self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, HostError> {
        self.registration(queue)?.handlers.push(handler);
        Ok(self)
    }

    /// Add an error handler applied to every queue.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::AlreadyStarted`] while workers are running.
    pub fn register_error_handler(&mut self, handler: Arc<dyn ErrorHandler>) -> Result<&mut Self, HostError> {
        self.ensure_stopped()?;
        self.error_handlers.push(handler);
        Ok(self)
    }

    /// Add middleware applied to every queue.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::AlreadyStarted`] while workers are running.
    pub fn register_middleware(&mut self, middleware: Arc<dyn Middleware>) -> Result<&mut Self, HostError> {
        self.ensure_stopped()?;
        self.middleware.push(middleware);
        Ok(self)
    }

    /// Provision every registered queue and topic, then spawn one worker per
    /// queue that has handlers.
    ///
    /// Nothing is spawned if any provisioning step fails.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if already started or provisioning fails.
    pub async fn start(&mut self) -> Result<(), HostError> {
        self.ensure_stopped()?;

        let mut provisioned: Vec<(QueueHandle, Option<QueueHandle>)> = Vec::new();
        for registration in &self.registrations {
            let queues = self.provisioning.queues();
            let handle = queues.create_queue(&registration.queue).await?;
            let dead_letter = queues.dead_letter_queue(&registration.queue).await?;
            for topic in &registration.topics {
                let topic_handle = self.provisioning.topics().create_topic(topic).await?;
                queues.subscribe(&handle, &topic_handle).await?;
            }
            provisioned.push((handle, dead_letter));
        }

        for (registration, (handle, dead_letter)) in self.registrations.iter().zip(provisioned) {
            if registration.handlers.is_empty() {
                tracing::warn!(queue = %handle.name, "Queue has no handlers, not consuming it");
                continue;
            }

            let status = Arc::new(WorkerStatus::new());
            let worker = QueueWorker::builder(Arc::clone(&self.broker), registration.queue.clone(), handle)
                .dead_letter(dead_letter)
                .handlers(registration.handlers.iter().cloned())
                .error_handlers(self.error_handlers.iter().cloned())
                .middleware(self.middleware.iter().cloned())
                .config(self.consumer)
                .shutdown(self.shutdown.signal())
                .status(Arc::clone(&status))
                .build();
            self.workers.push(RunningWorker {
                status,
                task: worker.spawn(),
            });
        }

        tracing::info!(workers = self.workers.len(), "Messaging host started");
        Ok(())
    }

    /// Signal every worker to stop and wait for them.
    ///
    /// Handler invocations in progress finish first; retry waits are cut short.
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shutdown.trigger();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.task.await {
                tracing::error!(error = %e, "Queue worker task failed");
            }
        }
        self.shutdown.reset();
        tracing::info!("Messaging host stopped");
    }

    /// Aggregate health: unhealthy if any worker is, idle if none runs.
    #[must_use]
    pub fn current_state(&self) -> WorkerState {
        let states = self.workers.iter().map(|worker| worker.status.state());
        let mut aggregate = WorkerState::Idle;
        for state in states {
            match state {
                WorkerState::Unhealthy => return WorkerState::Unhealthy,
                WorkerState::Healthy => aggregate = WorkerState::Healthy,
                WorkerState::Idle => {}
            }
        }
        aggregate
    }

    /// Handler invocations currently running across all workers.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.iter().map(|worker| worker.status.in_flight()).sum()
    }

    /// Whether workers are running.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !self.workers.is_empty()
    }

    fn ensure_stopped(&self) -> Result<(), HostError> {
        if self.is_started() {
            return Err(HostError::AlreadyStarted);
        }
        Ok(())
    }

    fn registration(&mut self, queue: &str) -> Result<&mut QueueRegistration, HostError> {
        self.ensure_stopped()?;
        self.registrations
            .iter_mut()
            .find(|registration| registration.queue.name() == queue)
            .ok_or_else(|| HostError::NotRegistered(queue.to_string()))
    }
}
