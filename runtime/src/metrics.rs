//! Prometheus metrics for the publisher and consumer loop.
//!
//! Recorders are free functions on unit structs so call sites stay one line.
//! Without an installed recorder every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//! // Later, from an HTTP handler:
//! let body = exporter.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and renders the scrape body.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the global recorder.
    ///
    /// A recorder installed earlier (in tests, by another exporter) is left
    /// in place and this call succeeds without a handle.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        describe_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn describe_metrics() {
    // Publisher
    describe_counter!(
        "courier_messages_published_total",
        "Messages published to topics or sent to queues"
    );
    describe_counter!(
        "courier_publish_errors_total",
        "Publish calls that failed"
    );
    describe_histogram!(
        "courier_publish_duration_seconds",
        "Time taken to publish a message, including lazy provisioning"
    );
    describe_counter!(
        "courier_resources_provisioned_total",
        "Topic/queue pairs provisioned by publishers"
    );

    // Consumer
    describe_counter!(
        "courier_messages_received_total",
        "Messages received from queues"
    );
    describe_counter!(
        "courier_messages_completed_total",
        "Deliveries that reached a terminal outcome, labelled by outcome"
    );
    describe_counter!(
        "courier_handler_failures_total",
        "Failed handler invocations"
    );
    describe_counter!(
        "courier_retries_total",
        "Handler retries scheduled"
    );
    describe_counter!(
        "courier_delete_errors_total",
        "Message deletes that failed"
    );
    describe_counter!(
        "courier_dead_letter_errors_total",
        "Forwards to the dead-letter queue that failed"
    );
    describe_counter!(
        "courier_receive_errors_total",
        "Poll cycles that failed"
    );
    describe_histogram!(
        "courier_handle_duration_seconds",
        "Time from receive to terminal outcome"
    );
    describe_gauge!(
        "courier_handlers_in_flight",
        "Handler invocations currently running"
    );
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a successful publish.
    pub fn record_publish(destination: &str, duration: Duration) {
        counter!("courier_messages_published_total", "destination" => destination.to_string())
            .increment(1);
        histogram!("courier_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_publish_error(destination: &str) {
        counter!("courier_publish_errors_total", "destination" => destination.to_string())
            .increment(1);
    }

    /// Record a newly provisioned topic/queue pair.
    pub fn record_provisioned() {
        counter!("courier_resources_provisioned_total").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a batch of received messages.
    pub fn record_received(queue: &str, count: usize) {
        counter!("courier_messages_received_total", "queue" => queue.to_string())
            .increment(count as u64);
    }

    /// Record a terminal outcome.
    pub fn record_completed(queue: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "courier_messages_completed_total",
            "queue" => queue.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("courier_handle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed handler invocation.
    pub fn record_handler_failure(queue: &str) {
        counter!("courier_handler_failures_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a scheduled retry.
    pub fn record_retry(queue: &str) {
        counter!("courier_retries_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a failed delete.
    pub fn record_delete_error(queue: &str) {
        counter!("courier_delete_errors_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a failed dead-letter forward.
    pub fn record_dead_letter_error(queue: &str) {
        counter!("courier_dead_letter_errors_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a failed poll cycle.
    pub fn record_receive_error(queue: &str) {
        counter!("courier_receive_errors_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record the number of handler invocations in flight.
    #[allow(clippy::cast_precision_loss)] // in-flight counts are small
    pub fn record_in_flight(count: usize) {
        gauge!("courier_handlers_in_flight").set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_renders_nothing_before_install() {
        let exporter = MetricsExporter::new();
        assert!(exporter.render().is_none());
    }

    #[test]
    fn install_tolerates_existing_recorder() {
        let mut first = MetricsExporter::new();
        assert!(first.install().is_ok());
        let mut second = MetricsExporter::new();
        assert!(second.install().is_ok());
    }

    #[test]
    fn recorders_are_noops_without_recorder() {
        PublisherMetrics::record_publish("topic", Duration::from_millis(5));
        PublisherMetrics::record_publish_error("topic");
        PublisherMetrics::record_provisioned();
        ConsumerMetrics::record_received("queue", 3);
        ConsumerMetrics::record_completed("queue", "handled", Duration::from_millis(1));
        ConsumerMetrics::record_handler_failure("queue");
        ConsumerMetrics::record_retry("queue");
        ConsumerMetrics::record_delete_error("queue");
        ConsumerMetrics::record_dead_letter_error("queue");
        ConsumerMetrics::record_receive_error("queue");
        ConsumerMetrics::record_in_flight(2);
    }
}
