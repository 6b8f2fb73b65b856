//! Per-message delivery: route, retry, then delete, dead-letter or leave.
//!
//! ```text
//! received ──► decode ──► route ──► invoke ──ok──────────────► delete
//!                           │          │
//!                           │          └─err─► retry? ──yes──► extend visibility, wait, invoke
//!                           │                     └─no──► DLQ forward (if enabled), delete
//!                           └─no handler──► delete
//! ```
//!
//! A handler can cut the loop short: `abort` leaves the message on the queue,
//! `fail` dead-letters it, `ignore` deletes it. A shutdown during a retry wait
//! abandons the delivery without deleting it.

use crate::metrics::ConsumerMetrics;
use crate::shutdown::ShutdownSignal;
use courier_core::broker::{Broker, OutboundMessage, QueueHandle, ReceivedMessage};
use courier_core::handler::{DeliveryOutcome, ErrorHandler, HandlerError, MessageHandler, Middleware};
use courier_core::message::{Disposition, Message, MessageArgs};
use courier_core::resource::Queue;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Attribute added to dead-lettered messages with the last failure.
pub const FAILURE_REASON: &str = "courier-failure-reason";
/// Attribute added to dead-lettered messages with the failed invocation count.
pub const RETRY_ATTEMPTS: &str = "courier-retry-attempts";

/// Where a delivery stopped, before the broker is told.
enum Verdict {
    Handled,
    Ignored,
    Unrouted,
    Aborted,
    Interrupted,
    Failed(String),
}

/// Applies one queue's handlers and retry policy to received messages.
pub(crate) struct Dispatcher {
    pub(crate) queue: Queue,
    pub(crate) handle: QueueHandle,
    pub(crate) dead_letter: Option<QueueHandle>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) handlers: Vec<Arc<dyn MessageHandler>>,
    pub(crate) error_handlers: Vec<Arc<dyn ErrorHandler>>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) visibility_timeout: Duration,
    pub(crate) in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Deliver one message to completion.
    ///
    /// Runs inside the message's correlation scope and a `handle_message` span.
    pub(crate) async fn dispatch(&self, received: ReceivedMessage, shutdown: &ShutdownSignal) -> DeliveryOutcome {
        let started = Instant::now();
        let message = Message::decode(&received.body, &received.attributes);
        let args = MessageArgs::new(
            received.body,
            received.receipt_handle,
            received.attributes,
            received.receive_count,
        );
        let correlation = message.correlation;
        let span = tracing::info_span!(
            "handle_message",
            queue = %self.handle.name,
            message_id = %message.id,
            broker_message_id = %received.message_id,
            topic = %message.topic,
            trace_id = %correlation.trace_id,
            span_id = %correlation.span_id,
            request_id = %correlation.request_id,
            session_id = %correlation.session_id,
        );

        let delivery = async {
            for middleware in &self.middleware {
                middleware.before(&message, &args).await;
            }

            let verdict = self.run(&message, &args, shutdown).await;
            let outcome = self.settle(&message, &args, verdict).await;

            for middleware in &self.middleware {
                middleware.after(&message, &args, outcome).await;
            }

            ConsumerMetrics::record_completed(&self.handle.name, outcome.as_str(), started.elapsed());
            tracing::debug!(
                outcome = outcome.as_str(),
                retry_attempts = args.retry_attempts(),
                "Delivery finished"
            );
            outcome
        };

        correlation.scope(delivery.instrument(span)).await
    }

    async fn run(&self, message: &Message, args: &MessageArgs, shutdown: &ShutdownSignal) -> Verdict {
        let handlers: Vec<&Arc<dyn MessageHandler>> = self
            .handlers
            .iter()
            .filter(|handler| handler.can_process(message, args))
            .collect();

        if handlers.is_empty() {
            tracing::warn!(topic = %message.topic, "No handler accepts message, deleting it");
            return Verdict::Unrouted;
        }

        let policy = self.queue.retry_policy();
        loop {
            let error = match self.invoke(&handlers, message, args).await {
                Ok(()) => {
                    return match args.disposition() {
                        Some(Disposition::Aborted) => Verdict::Aborted,
                        Some(Disposition::Failed) => {
                            let error = anyhow::anyhow!("failed by handler");
                            self.give_up(message, args, &error).await;
                            Verdict::Failed(error.to_string())
                        }
                        Some(Disposition::Ignored) => Verdict::Ignored,
                        None => Verdict::Handled,
                    };
                }
                Err(error) => error,
            };

            let failures = args.record_failure();
            ConsumerMetrics::record_handler_failure(&self.handle.name);
            tracing::warn!(attempt = failures, error = %format_args!("{error:#}"), "Handler failed");
            for handler in &self.error_handlers {
                handler.on_error(message, args, &error).await;
            }

            match args.disposition() {
                Some(Disposition::Aborted) => return Verdict::Aborted,
                Some(Disposition::Ignored) => return Verdict::Ignored,
                Some(Disposition::Failed) => {
                    self.give_up(message, args, &error).await;
                    return Verdict::Failed(format!("{error:#}"));
                }
                None => {}
            }

            if !policy.allows_retry(failures) {
                tracing::error!(
                    attempts = failures,
                    max_retries = policy.max_retries(),
                    error = %error,
                    "Retries exhausted, giving up"
                );
                self.give_up(message, args, &error).await;
                return Verdict::Failed(format!("{error:#}"));
            }

            let delay = policy.delay_for_attempt(failures);
            ConsumerMetrics::record_retry(&self.handle.name);
            tracing::info!(
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying message"
            );

            self.extend_visibility(args).await;
            if !shutdown.sleep(delay).await {
                tracing::info!("Shutdown during retry wait, leaving message on queue");
                return Verdict::Interrupted;
            }
        }
    }

    /// Run every accepting handler in order, stopping at the first error or
    /// disposition.
    async fn invoke(
        &self,
        handlers: &[&Arc<dyn MessageHandler>],
        message: &Message,
        args: &MessageArgs,
    ) -> Result<(), HandlerError> {
        for handler in handlers {
            let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            ConsumerMetrics::record_in_flight(count);

            let result = AssertUnwindSafe(handler.process_message(message, args))
                .catch_unwind()
                .await;

            let count = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
            ConsumerMetrics::record_in_flight(count);

            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::debug!(handler = handler.name(), "Handler returned an error");
                    return Err(error);
                }
                Err(_) => return Err(anyhow::anyhow!("handler '{}' panicked", handler.name())),
            }

            if args.disposition().is_some() {
                break;
            }
        }
        Ok(())
    }

    async fn give_up(&self, message: &Message, args: &MessageArgs, error: &HandlerError) {
        for handler in &self.error_handlers {
            handler.on_give_up(message, args, error).await;
        }
    }

    /// Tell the broker how the delivery ended.
    async fn settle(&self, message: &Message, args: &MessageArgs, verdict: Verdict) -> DeliveryOutcome {
        match verdict {
            Verdict::Handled => {
                self.delete(args).await;
                DeliveryOutcome::Handled
            }
            Verdict::Ignored => {
                self.delete(args).await;
                DeliveryOutcome::Ignored
            }
            Verdict::Unrouted => {
                self.delete(args).await;
                DeliveryOutcome::Unrouted
            }
            Verdict::Aborted => {
                tracing::info!("Handler aborted, leaving message for redelivery");
                DeliveryOutcome::Aborted
            }
            Verdict::Interrupted => DeliveryOutcome::Interrupted,
            Verdict::Failed(reason) => match &self.dead_letter {
                Some(dead_letter) => {
                    if self.forward(dead_letter, message, args, &reason).await {
                        self.delete(args).await;
                        DeliveryOutcome::DeadLettered
                    } else {
                        // Left in place; broker redrive moves it later.
                        DeliveryOutcome::DeadLetterFailed
                    }
                }
                None => {
                    self.delete(args).await;
                    DeliveryOutcome::GaveUp
                }
            },
        }
    }

    async fn forward(&self, dead_letter: &QueueHandle, message: &Message, args: &MessageArgs, reason: &str) -> bool {
        let mut attributes = args.attributes().clone();
        attributes.insert(FAILURE_REASON.to_string(), reason.to_string());
        attributes.insert(RETRY_ATTEMPTS.to_string(), args.retry_attempts().to_string());

        let outbound = OutboundMessage {
            body: args.raw().to_string(),
            attributes,
            group_id: self.queue.is_fifo().then(|| self.queue.name().to_string()),
            deduplication_id: self.queue.is_fifo().then(|| message.id.to_string()),
            ..OutboundMessage::default()
        };

        match self.broker.send_message(dead_letter, outbound).await {
            Ok(dlq_message_id) => {
                tracing::warn!(
                    dead_letter_queue = %dead_letter.name,
                    dlq_message_id = %dlq_message_id,
                    reason = %reason,
                    "Message moved to dead-letter queue"
                );
                true
            }
            Err(error) => {
                ConsumerMetrics::record_dead_letter_error(&self.handle.name);
                tracing::error!(
                    dead_letter_queue = %dead_letter.name,
                    error = %error,
                    "Failed to forward message to dead-letter queue, leaving it on the queue"
                );
                false
            }
        }
    }

    async fn delete(&self, args: &MessageArgs) {
        if let Err(error) = self.broker.delete_message(&self.handle, args.receipt_handle()).await {
            ConsumerMetrics::record_delete_error(&self.handle.name);
            tracing::error!(error = %error, "Failed to delete message, it may be redelivered");
        }
    }

    async fn extend_visibility(&self, args: &MessageArgs) {
        if let Err(error) = self
            .broker
            .change_message_visibility(&self.handle, args.receipt_handle(), self.visibility_timeout)
            .await
        {
            tracing::warn!(error = %error, "Failed to extend message visibility");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::broker::ReceiveOptions;
    use courier_core::correlation::Correlation;
    use courier_core::resource::RetryPolicy;
    use courier_testing::handlers::{AlwaysFails, FailsTimes, FnHandler, Recording};
    use courier_testing::{BrokerFailure, InMemoryBroker};
    use std::sync::Mutex;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        handle: QueueHandle,
        dead_letter: Option<QueueHandle>,
    }

    fn fixture(queue: &Queue) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let handle = broker.create_queue_named(queue.name());
        let dead_letter = if queue.enable_dlq() {
            Some(broker.create_queue_named(&format!("{}-dlq", queue.name())))
        } else {
            None
        };
        Fixture {
            broker,
            handle,
            dead_letter,
        }
    }

    impl Fixture {
        fn dispatcher(&self, queue: Queue, handlers: Vec<Arc<dyn MessageHandler>>) -> Dispatcher {
            Dispatcher {
                queue,
                handle: self.handle.clone(),
                dead_letter: self.dead_letter.clone(),
                broker: Arc::clone(&self.broker) as Arc<dyn Broker>,
                handlers,
                error_handlers: Vec::new(),
                middleware: Vec::new(),
                visibility_timeout: Duration::from_secs(600),
                in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        async fn deliver(&self, body: &str) -> ReceivedMessage {
            let message = Message::new("t", serde_json::json!(body), Correlation::new(), Default::default());
            self.broker
                .send_message(
                    &self.handle,
                    OutboundMessage {
                        body: message.encode_body(true).unwrap(),
                        attributes: message.attributes(),
                        ..OutboundMessage::default()
                    },
                )
                .await
                .unwrap();
            self.broker
                .receive_messages(&self.handle, ReceiveOptions::default())
                .await
                .unwrap()
                .remove(0)
        }
    }

    fn retrying(max_retries: u32) -> Queue {
        Queue::new("q").with_retry_policy(RetryPolicy::new(Duration::from_secs(1), false, max_retries))
    }

    #[tokio::test(start_paused = true)]
    async fn success_deletes_message() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let recording = Arc::new(Recording::new());
        let dispatcher = fx.dispatcher(queue, vec![recording.clone()]);

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::Handled);
        assert_eq!(recording.count(), 1);
        assert_eq!(fx.broker.pending("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_handler_runs_max_retries_times() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let failing = Arc::new(AlwaysFails::new());
        let dispatcher = fx.dispatcher(queue, vec![failing.clone()]);

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::GaveUp);
        assert_eq!(failing.count(), 3);
        assert_eq!(fx.broker.pending("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_retries_still_invokes_once() {
        let queue = retrying(0);
        let fx = fixture(&queue);
        let failing = Arc::new(AlwaysFails::new());
        let dispatcher = fx.dispatcher(queue, vec![failing.clone()]);

        let received = fx.deliver("A").await;
        dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(failing.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_waits_between_attempts() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let flaky = Arc::new(FailsTimes::new(2));
        let dispatcher = fx.dispatcher(queue, vec![flaky.clone()]);

        let received = fx.deliver("A").await;
        let started = tokio::time::Instant::now();
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::Handled);
        assert_eq!(flaky.count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(fx.broker.calls().change_visibility, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_grows_linearly() {
        let queue = Queue::new("q").with_retry_policy(RetryPolicy::new(Duration::from_secs(1), true, 3));
        let fx = fixture(&queue);
        let dispatcher = fx.dispatcher(queue, vec![Arc::new(AlwaysFails::new())]);

        let received = fx.deliver("A").await;
        let started = tokio::time::Instant::now();
        dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_leaves_message_without_retrying() {
        let queue = retrying(5);
        let fx = fixture(&queue);
        let aborting = Arc::new(FnHandler::new(|_, args| {
            args.abort();
            Err(anyhow::anyhow!("downstream unavailable"))
        }));
        let dispatcher = fx.dispatcher(queue, vec![aborting.clone()]);

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::Aborted);
        assert_eq!(aborting.count(), 1);
        assert_eq!(fx.broker.pending("q"), 1);
        assert_eq!(fx.broker.calls().delete, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_routes_to_dead_letter_queue() {
        let queue = retrying(5).with_dead_letter_queue(true);
        let fx = fixture(&queue);
        let dispatcher = fx.dispatcher(
            queue,
            vec![Arc::new(FnHandler::new(|_, args| {
                args.fail();
                Err(anyhow::anyhow!("malformed booking"))
            }))],
        );

        let received = fx.deliver("A").await;
        let raw = received.body.clone();
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(fx.broker.pending("q"), 0);
        let dead = fx.broker.peek("q-dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, raw);
        assert!(dead[0].attributes[FAILURE_REASON].contains("malformed booking"));
        assert_eq!(dead[0].attributes[RETRY_ATTEMPTS], "1");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_route_to_dead_letter_queue() {
        let queue = retrying(2).with_dead_letter_queue(true);
        let fx = fixture(&queue);
        let dispatcher = fx.dispatcher(queue, vec![Arc::new(AlwaysFails::new())]);

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(fx.broker.peek("q-dlq")[0].attributes[RETRY_ATTEMPTS], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_forward_leaves_message_on_queue() {
        let queue = retrying(1).with_dead_letter_queue(true);
        let fx = fixture(&queue);
        let dispatcher = fx.dispatcher(queue, vec![Arc::new(AlwaysFails::new())]);
        let received = fx.deliver("A").await;
        fx.broker.fail_next(BrokerFailure::SendMessage);

        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLetterFailed);
        assert!(!outcome.deletes_message());
        assert_eq!(fx.broker.pending("q"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ignore_skips_remaining_handlers() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let ignoring = Arc::new(FnHandler::new(|_, args| {
            args.ignore();
            Ok(())
        }));
        let second = Arc::new(Recording::new());
        let dispatcher = fx.dispatcher(queue, vec![ignoring, second.clone()]);

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::Ignored);
        assert_eq!(second.count(), 0);
        assert_eq!(fx.broker.pending("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unrouted_message_is_deleted() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let picky = Arc::new(Recording::new().only_topic("something-else"));
        let dispatcher = fx.dispatcher(queue, vec![picky.clone()]);

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::Unrouted);
        assert_eq!(picky.count(), 0);
        assert_eq!(fx.broker.pending("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_is_treated_as_failure() {
        let queue = retrying(2);
        let fx = fixture(&queue);
        let dispatcher = fx.dispatcher(
            queue,
            vec![Arc::new(FnHandler::new(|_, _| -> courier_core::HandlerResult {
                panic!("boom")
            }))],
        );

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::GaveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_retry_wait() {
        let queue = Queue::new("q").with_retry_policy(RetryPolicy::new(Duration::from_secs(60), false, 5));
        let fx = fixture(&queue);
        let failing = Arc::new(AlwaysFails::new());
        let dispatcher = fx.dispatcher(queue, vec![failing.clone()]);
        let shutdown = crate::shutdown::Shutdown::new();

        let received = fx.deliver("A").await;
        let signal = shutdown.signal();
        let trigger = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.trigger();
        };
        let (outcome, ()) = tokio::join!(dispatcher.dispatch(received, &signal), trigger);

        assert_eq!(outcome, DeliveryOutcome::Interrupted);
        assert_eq!(failing.count(), 1);
        assert_eq!(fx.broker.pending("q"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_failure_does_not_escape() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let dispatcher = fx.dispatcher(queue, vec![Arc::new(Recording::new())]);
        let received = fx.deliver("A").await;
        fx.broker.fail_next(BrokerFailure::Delete);

        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::Handled);
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_run_inside_message_correlation() {
        let queue = retrying(1);
        let fx = fixture(&queue);
        let seen = Arc::new(Mutex::new(None));
        let observer = {
            let seen = Arc::clone(&seen);
            Arc::new(FnHandler::new(move |_, _| {
                *seen.lock().unwrap() = Correlation::current();
                Ok(())
            }))
        };
        let dispatcher = fx.dispatcher(queue, vec![observer]);

        let received = fx.deliver("A").await;
        let expected = Correlation::from_attributes(&received.attributes);
        dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(*seen.lock().unwrap(), Some(expected));
    }

    struct CountingErrors {
        errors: AtomicUsize,
        give_ups: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ErrorHandler for CountingErrors {
        async fn on_error(&self, _: &Message, _: &MessageArgs, _: &HandlerError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_give_up(&self, _: &Message, _: &MessageArgs, _: &HandlerError) {
            self.give_ups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Outcomes(Mutex<Vec<DeliveryOutcome>>);

    #[async_trait::async_trait]
    impl Middleware for Outcomes {
        async fn after(&self, _: &Message, _: &MessageArgs, outcome: DeliveryOutcome) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_handlers_and_middleware_observe_delivery() {
        let queue = retrying(3);
        let fx = fixture(&queue);
        let errors = Arc::new(CountingErrors {
            errors: AtomicUsize::new(0),
            give_ups: AtomicUsize::new(0),
        });
        let outcomes = Arc::new(Outcomes(Mutex::new(Vec::new())));
        let mut dispatcher = fx.dispatcher(queue, vec![Arc::new(AlwaysFails::new())]);
        dispatcher.error_handlers.push(errors.clone());
        dispatcher.middleware.push(outcomes.clone());

        let received = fx.deliver("A").await;
        dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(errors.errors.load(Ordering::SeqCst), 3);
        assert_eq!(errors.give_ups.load(Ordering::SeqCst), 1);
        assert_eq!(*outcomes.0.lock().unwrap(), vec![DeliveryOutcome::GaveUp]);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_without_error_reaches_give_up_handlers() {
        let queue = retrying(3).with_dead_letter_queue(true);
        let fx = fixture(&queue);
        let errors = Arc::new(CountingErrors {
            errors: AtomicUsize::new(0),
            give_ups: AtomicUsize::new(0),
        });
        let mut dispatcher = fx.dispatcher(
            queue,
            vec![Arc::new(FnHandler::new(|_, args| {
                args.fail();
                Ok(())
            }))],
        );
        dispatcher.error_handlers.push(errors.clone());

        let received = fx.deliver("A").await;
        let outcome = dispatcher.dispatch(received, &ShutdownSignal::never()).await;

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(errors.errors.load(Ordering::SeqCst), 0);
        assert_eq!(errors.give_ups.load(Ordering::SeqCst), 1);
        let dead = fx.broker.peek("q-dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attributes[FAILURE_REASON], "failed by handler");
    }
}
