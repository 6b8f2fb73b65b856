//! AWS SQS + SNS broker for Courier.
//!
//! This crate provides [`SqsBroker`], an implementation of the [`Broker`]
//! trait from `courier-core` on top of the official AWS SDK. Topics are SNS
//! topics, queues are SQS queues, and subscriptions deliver raw message bodies
//! so consumers see exactly what the publisher wrote.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  publish   ┌─────────────┐  raw delivery  ┌─────────────┐
//! │  Publisher  │──────────►│  SNS topic  │──────────────►│  SQS queue  │
//! └─────────────┘            └─────────────┘                └──────┬──────┘
//!        │ send_message                                            │ receive
//!        └────────────────────────────────────────────────────────►│
//!                                                                  ▼
//!                                                          ┌─────────────┐
//!                                                          │   Worker    │
//!                                                          └─────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery**:
//! - A received message stays hidden for the visibility timeout
//! - It is only removed when the consumer deletes it
//! - If the consumer crashes, the message reappears and is redelivered
//! - Queues with a dead-letter target are redriven by SQS after
//!   `max_receive_count` deliveries
//!
//! # Local Development
//!
//! Any SQS/SNS-compatible endpoint works (e.g. `LocalStack`). Set
//! `endpoint_url` to point the clients at it.
//!
//! # Example
//!
//! ```no_run
//! use courier_sqs::SqsBroker;
//! use courier_core::broker::Broker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = SqsBroker::builder()
//!     .region("us-east-1")
//!     .endpoint_url("http://localhost:4566")
//!     .build()
//!     .await?;
//!
//! let topic = broker.create_topic("orders", false).await?;
//! println!("topic arn: {}", topic.arn);
//! # Ok(())
//! # }
//! ```

use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::operation::create_queue::CreateQueueError;
use aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use courier_core::broker::{
    Broker, BrokerError, BrokerFuture, OutboundMessage, QueueHandle, QueueSpec, ReceiveOptions,
    ReceivedMessage, SubscriptionHandle, TopicHandle,
};
use courier_core::config::{AwsConfig, MAX_DELIVERY_DELAY, MAX_VISIBILITY_TIMEOUT, MAX_WAIT_TIME};
use courier_core::message::MessageAttributes;
use std::collections::HashMap;
use std::time::Duration;

/// Largest batch SQS returns from one receive.
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Page size for `ListQueues`.
const LIST_QUEUES_PAGE: i32 = 1000;

/// AWS SQS + SNS broker.
///
/// Cheap to clone; both SDK clients share one connection pool.
#[derive(Clone, Debug)]
pub struct SqsBroker {
    /// SQS client for queue operations
    sqs: aws_sdk_sqs::Client,
    /// SNS client for topic operations
    sns: aws_sdk_sns::Client,
}

impl SqsBroker {
    /// Create a broker from existing SDK clients.
    #[must_use]
    pub const fn new(sqs: aws_sdk_sqs::Client, sns: aws_sdk_sns::Client) -> Self {
        Self { sqs, sns }
    }

    /// Create a broker from a loaded AWS SDK configuration.
    #[must_use]
    pub fn from_sdk_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(
            aws_sdk_sqs::Client::new(config),
            aws_sdk_sns::Client::new(config),
        )
    }

    /// Create a broker from Courier's connection settings.
    ///
    /// Credentials come from the default AWS provider chain.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the region is empty.
    pub async fn from_config(config: &AwsConfig) -> Result<Self, BrokerError> {
        let mut builder = Self::builder().region(config.region.clone());
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone());
        }
        builder.build().await
    }

    /// Create a builder for configuring the broker.
    #[must_use]
    pub fn builder() -> SqsBrokerBuilder {
        SqsBrokerBuilder::new()
    }
}

/// Builder for configuring an [`SqsBroker`].
#[derive(Debug, Default)]
pub struct SqsBrokerBuilder {
    region: Option<String>,
    endpoint_url: Option<String>,
    credentials: Option<(String, String)>,
}

impl SqsBrokerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the AWS region (required).
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Point both clients at a custom endpoint (e.g. `LocalStack`).
    #[must_use]
    pub fn endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    /// Use static credentials instead of the default provider chain.
    #[must_use]
    pub fn credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some((access_key_id.into(), secret_access_key.into()));
        self
    }

    /// Load the SDK configuration and build the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if no region is set.
    pub async fn build(self) -> Result<SqsBroker, BrokerError> {
        let region = self
            .region
            .filter(|region| !region.is_empty())
            .ok_or_else(|| BrokerError::ConnectionFailed("region is required".to_string()))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.clone()));
        if let Some(endpoint) = &self.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let Some((access_key_id, secret_access_key)) = self.credentials {
            loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "courier-static",
            ));
        }
        let config = loader.load().await;

        tracing::info!(
            region = %region,
            endpoint = self.endpoint_url.as_deref().unwrap_or("default"),
            "SQS broker created"
        );

        Ok(SqsBroker::from_sdk_config(&config))
    }
}

impl Broker for SqsBroker {
    fn create_topic(&self, name: &str, fifo: bool) -> BrokerFuture<'_, TopicHandle> {
        let name = name.to_string();
        Box::pin(async move {
            let mut request = self.sns.create_topic().name(&name);
            if fifo {
                request = request
                    .attributes("FifoTopic", "true")
                    .attributes("ContentBasedDeduplication", "false");
            }
            let output = request
                .send()
                .await
                .map_err(|e| sdk_error("CreateTopic", &e))?;
            let arn = output
                .topic_arn()
                .ok_or_else(|| missing("CreateTopic", "TopicArn"))?
                .to_string();

            tracing::debug!(topic = %name, arn = %arn, "Topic ready");
            Ok(TopicHandle { name, arn })
        })
    }

    fn list_topics(&self) -> BrokerFuture<'_, Vec<TopicHandle>> {
        Box::pin(async move {
            let mut topics = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                let output = self
                    .sns
                    .list_topics()
                    .set_next_token(next_token.take())
                    .send()
                    .await
                    .map_err(|e| sdk_error("ListTopics", &e))?;

                topics.extend(output.topics().iter().filter_map(|topic| {
                    let arn = topic.topic_arn()?;
                    Some(TopicHandle {
                        name: topic_name_from_arn(arn).to_string(),
                        arn: arn.to_string(),
                    })
                }));

                match output.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }
            Ok(topics)
        })
    }

    fn create_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, QueueHandle> {
        let spec = spec.clone();
        Box::pin(async move {
            let attributes = queue_attributes(&spec);
            let created = self
                .sqs
                .create_queue()
                .queue_name(&spec.name)
                .set_attributes(Some(attributes))
                .send()
                .await;

            let url = match created {
                Ok(output) => output
                    .queue_url()
                    .ok_or_else(|| missing("CreateQueue", "QueueUrl"))?
                    .to_string(),
                Err(e)
                    if e.as_service_error()
                        .is_some_and(CreateQueueError::is_queue_name_exists) =>
                {
                    // Exists with different attributes; keep the live queue.
                    tracing::debug!(queue = %spec.name, "Queue exists with other attributes");
                    self.queue_url(&spec.name)
                        .await?
                        .ok_or_else(|| BrokerError::NotFound {
                            resource: spec.name.clone(),
                        })?
                }
                Err(e) => return Err(sdk_error("CreateQueue", &e)),
            };

            let arn = self.queue_arn(&url).await?;
            if let Some(policy) = sns_delivery_policy(&arn) {
                self.sqs
                    .set_queue_attributes()
                    .queue_url(&url)
                    .attributes(QueueAttributeName::Policy, policy)
                    .send()
                    .await
                    .map_err(|e| sdk_error("SetQueueAttributes", &e))?;
            }

            tracing::debug!(queue = %spec.name, url = %url, "Queue ready");
            Ok(QueueHandle {
                name: spec.name,
                url,
                arn,
            })
        })
    }

    fn find_queue(&self, name: &str) -> BrokerFuture<'_, Option<QueueHandle>> {
        let name = name.to_string();
        Box::pin(async move {
            let Some(url) = self.queue_url(&name).await? else {
                return Ok(None);
            };
            let arn = self.queue_arn(&url).await?;
            Ok(Some(QueueHandle { name, url, arn }))
        })
    }

    fn list_queues(&self, prefix: &str) -> BrokerFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let mut names = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                let mut request = self
                    .sqs
                    .list_queues()
                    .max_results(LIST_QUEUES_PAGE)
                    .set_next_token(next_token.take());
                if !prefix.is_empty() {
                    request = request.queue_name_prefix(&prefix);
                }
                let output = request
                    .send()
                    .await
                    .map_err(|e| sdk_error("ListQueues", &e))?;

                names.extend(
                    output
                        .queue_urls()
                        .iter()
                        .map(|url| queue_name_from_url(url).to_string()),
                );

                match output.next_token() {
                    Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                    _ => break,
                }
            }
            Ok(names)
        })
    }

    fn subscribe(
        &self,
        topic: &TopicHandle,
        queue: &QueueHandle,
    ) -> BrokerFuture<'_, SubscriptionHandle> {
        let topic_arn = topic.arn.clone();
        let queue_arn = queue.arn.clone();
        Box::pin(async move {
            // SNS returns the existing subscription for identical parameters.
            let output = self
                .sns
                .subscribe()
                .topic_arn(&topic_arn)
                .protocol("sqs")
                .endpoint(&queue_arn)
                .attributes("RawMessageDelivery", "true")
                .return_subscription_arn(true)
                .send()
                .await
                .map_err(|e| sdk_error("Subscribe", &e))?;
            let arn = output
                .subscription_arn()
                .ok_or_else(|| missing("Subscribe", "SubscriptionArn"))?
                .to_string();

            tracing::debug!(topic = %topic_arn, queue = %queue_arn, "Subscription ready");
            Ok(SubscriptionHandle {
                arn,
                topic_arn,
                queue_arn,
            })
        })
    }

    fn publish(&self, topic: &TopicHandle, message: OutboundMessage) -> BrokerFuture<'_, String> {
        let topic_arn = topic.arn.clone();
        Box::pin(async move {
            let attributes = sns_attributes(&message.attributes)?;
            let output = self
                .sns
                .publish()
                .topic_arn(&topic_arn)
                .message(message.body)
                .set_message_attributes(Some(attributes))
                .set_message_group_id(message.group_id)
                .set_message_deduplication_id(message.deduplication_id)
                .send()
                .await
                .map_err(|e| sdk_error("Publish", &e))?;
            Ok(output.message_id().unwrap_or_default().to_string())
        })
    }

    fn send_message(
        &self,
        queue: &QueueHandle,
        message: OutboundMessage,
    ) -> BrokerFuture<'_, String> {
        let url = queue.url.clone();
        Box::pin(async move {
            let attributes = sqs_attributes(&message.attributes)?;
            let output = self
                .sqs
                .send_message()
                .queue_url(&url)
                .message_body(message.body)
                .set_message_attributes(Some(attributes))
                .delay_seconds(seconds(message.delay, MAX_DELIVERY_DELAY))
                .set_message_group_id(message.group_id)
                .set_message_deduplication_id(message.deduplication_id)
                .send()
                .await
                .map_err(|e| sdk_error("SendMessage", &e))?;
            Ok(output.message_id().unwrap_or_default().to_string())
        })
    }

    fn receive_messages(
        &self,
        queue: &QueueHandle,
        options: ReceiveOptions,
    ) -> BrokerFuture<'_, Vec<ReceivedMessage>> {
        let url = queue.url.clone();
        Box::pin(async move {
            let output = self
                .sqs
                .receive_message()
                .queue_url(&url)
                .max_number_of_messages(batch_size(options.max_messages))
                .wait_time_seconds(seconds(options.wait_time, MAX_WAIT_TIME))
                .visibility_timeout(seconds(options.visibility_timeout, MAX_VISIBILITY_TIMEOUT))
                .message_attribute_names("All")
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .send()
                .await
                .map_err(|e| sdk_error("ReceiveMessage", &e))?;

            Ok(output.messages().iter().filter_map(received_message).collect())
        })
    }

    fn delete_message(&self, queue: &QueueHandle, receipt_handle: &str) -> BrokerFuture<'_, ()> {
        let url = queue.url.clone();
        let receipt_handle = receipt_handle.to_string();
        Box::pin(async move {
            self.sqs
                .delete_message()
                .queue_url(&url)
                .receipt_handle(receipt_handle)
                .send()
                .await
                .map_err(|e| sdk_error("DeleteMessage", &e))?;
            Ok(())
        })
    }

    fn change_message_visibility(
        &self,
        queue: &QueueHandle,
        receipt_handle: &str,
        timeout: Duration,
    ) -> BrokerFuture<'_, ()> {
        let url = queue.url.clone();
        let receipt_handle = receipt_handle.to_string();
        Box::pin(async move {
            self.sqs
                .change_message_visibility()
                .queue_url(&url)
                .receipt_handle(receipt_handle)
                .visibility_timeout(seconds(timeout, MAX_VISIBILITY_TIMEOUT))
                .send()
                .await
                .map_err(|e| sdk_error("ChangeMessageVisibility", &e))?;
            Ok(())
        })
    }
}

impl SqsBroker {
    /// URL of a queue, or `None` if it does not exist.
    async fn queue_url(&self, name: &str) -> Result<Option<String>, BrokerError> {
        match self.sqs.get_queue_url().queue_name(name).send().await {
            Ok(output) => Ok(output.queue_url().map(str::to_string)),
            Err(e)
                if e.as_service_error()
                    .is_some_and(GetQueueUrlError::is_queue_does_not_exist) =>
            {
                Ok(None)
            }
            Err(e) => Err(sdk_error("GetQueueUrl", &e)),
        }
    }

    async fn queue_arn(&self, url: &str) -> Result<String, BrokerError> {
        let output = self
            .sqs
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| sdk_error("GetQueueAttributes", &e))?;
        output
            .attributes()
            .and_then(|attributes| attributes.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| missing("GetQueueAttributes", "QueueArn"))
    }
}

/// Map an SDK failure: service errors are rejections, the rest is transport.
fn sdk_error<E, R>(operation: &str, error: &SdkError<E, R>) -> BrokerError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = DisplayErrorContext(error).to_string();
    match error {
        SdkError::ServiceError(_) => BrokerError::rejected(operation, detail),
        SdkError::ConstructionFailure(_) => BrokerError::ConnectionFailed(detail),
        _ => BrokerError::Transport(format!("{operation}: {detail}")),
    }
}

fn missing(operation: &str, field: &str) -> BrokerError {
    BrokerError::rejected(operation, format!("response has no {field}"))
}

fn queue_attributes(spec: &QueueSpec) -> HashMap<QueueAttributeName, String> {
    let mut attributes = HashMap::new();
    if spec.fifo {
        attributes.insert(QueueAttributeName::FifoQueue, "true".to_string());
        attributes.insert(QueueAttributeName::ContentBasedDeduplication, "false".to_string());
    }
    if let Some(timeout) = spec.visibility_timeout {
        attributes.insert(
            QueueAttributeName::VisibilityTimeout,
            seconds(timeout, MAX_VISIBILITY_TIMEOUT).to_string(),
        );
    }
    if let Some(target) = &spec.dead_letter {
        let policy = serde_json::json!({
            "deadLetterTargetArn": target.arn,
            "maxReceiveCount": target.max_receive_count.to_string(),
        });
        attributes.insert(QueueAttributeName::RedrivePolicy, policy.to_string());
    }
    attributes
}

/// Queue policy letting SNS topics in the queue's account deliver to it.
fn sns_delivery_policy(queue_arn: &str) -> Option<String> {
    let mut parts = queue_arn.split(':');
    let (Some("arn"), Some(partition), Some("sqs"), Some(region), Some(account)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };

    let policy = serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "courier-sns-delivery",
            "Effect": "Allow",
            "Principal": { "Service": "sns.amazonaws.com" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {
                "ArnLike": { "aws:SourceArn": format!("arn:{partition}:sns:{region}:{account}:*") }
            }
        }]
    });
    Some(policy.to_string())
}

// SQS and SNS reject empty string attribute values.
fn sqs_attributes(
    attributes: &MessageAttributes,
) -> Result<HashMap<String, aws_sdk_sqs::types::MessageAttributeValue>, BrokerError> {
    attributes
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| {
            let value = aws_sdk_sqs::types::MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| BrokerError::Serialization(format!("attribute {key}: {e}")))?;
            Ok((key.clone(), value))
        })
        .collect()
}

fn sns_attributes(
    attributes: &MessageAttributes,
) -> Result<HashMap<String, aws_sdk_sns::types::MessageAttributeValue>, BrokerError> {
    attributes
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| {
            let value = aws_sdk_sns::types::MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| BrokerError::Serialization(format!("attribute {key}: {e}")))?;
            Ok((key.clone(), value))
        })
        .collect()
}

/// Convert an SDK message, skipping anything without a receipt handle.
fn received_message(message: &aws_sdk_sqs::types::Message) -> Option<ReceivedMessage> {
    let receipt_handle = message.receipt_handle()?.to_string();
    let attributes = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .string_value()
                        .map(|value| (key.clone(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();
    let receive_count = message
        .attributes()
        .and_then(|attributes| attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(1);

    Some(ReceivedMessage {
        message_id: message.message_id().unwrap_or_default().to_string(),
        receipt_handle,
        body: message.body().unwrap_or_default().to_string(),
        attributes,
        receive_count,
    })
}

/// Whole seconds, capped at `max`, as the SDK's `i32`.
fn seconds(duration: Duration, max: Duration) -> i32 {
    i32::try_from(duration.min(max).as_secs()).unwrap_or(i32::MAX)
}

fn batch_size(max_messages: u32) -> i32 {
    i32::try_from(max_messages.clamp(1, MAX_RECEIVE_BATCH)).unwrap_or(1)
}

fn topic_name_from_arn(arn: &str) -> &str {
    arn.rsplit(':').next().unwrap_or(arn)
}

fn queue_name_from_url(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}
