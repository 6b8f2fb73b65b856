//! Message envelope and per-delivery control state.
//!
//! A [`Message`] is created by the publisher and never changes in transit.
//! Each delivery attempt decodes a fresh instance from the wire body, paired
//! with a fresh [`MessageArgs`] holding that delivery's receipt handle, retry
//! counter and disposition flags.
//!
//! # Wire format
//!
//! The body is JSON: either the full envelope (`useDefaultEnvelope`) or the
//! bare content. Metadata always rides in string attributes:
//!
//! | Attribute | Value |
//! |---|---|
//! | `courier-message-id` | envelope id |
//! | `courier-topic` | logical topic name |
//! | `courier-published-at` | RFC 3339 timestamp |
//! | `courier-identity` | JSON object of identity attributes |
//! | `courier-trace-id` … `courier-session-id` | correlation |

use crate::correlation::Correlation;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use uuid::Uuid;

/// String key/value attributes carried beside the body.
pub type MessageAttributes = BTreeMap<String, String>;

/// Arbitrary requester attributes (user id, tenant, roles...).
pub type Identity = BTreeMap<String, String>;

/// Attribute key carrying the envelope id.
pub const MESSAGE_ID: &str = "courier-message-id";
/// Attribute key carrying the logical topic name.
pub const TOPIC: &str = "courier-topic";
/// Attribute key carrying the publish timestamp.
pub const PUBLISHED_AT: &str = "courier-published-at";
/// Attribute key carrying the identity map as JSON.
pub const IDENTITY: &str = "courier-identity";

/// The unit moved through the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id generated at creation.
    pub id: Uuid,
    /// Logical topic name.
    pub topic: String,
    /// Opaque payload.
    pub content: serde_json::Value,
    /// When the publisher created the message.
    pub published_at: DateTime<Utc>,
    /// Correlation identifiers.
    pub correlation: Correlation,
    /// Requester attributes.
    #[serde(default)]
    pub identity: Identity,
}

impl Message {
    /// Create a message stamped with a new id and the current time.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        content: serde_json::Value,
        correlation: Correlation,
        identity: Identity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            content,
            published_at: Utc::now(),
            correlation,
            identity,
        }
    }

    /// Deserialize the content into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the content does not match `T`.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.content)
    }

    /// Attributes describing this message on the wire.
    #[must_use]
    pub fn attributes(&self) -> MessageAttributes {
        let mut attributes = MessageAttributes::new();
        attributes.insert(MESSAGE_ID.to_string(), self.id.to_string());
        attributes.insert(TOPIC.to_string(), self.topic.clone());
        attributes.insert(PUBLISHED_AT.to_string(), self.published_at.to_rfc3339());
        if !self.identity.is_empty() {
            if let Ok(identity) = serde_json::to_string(&self.identity) {
                attributes.insert(IDENTITY.to_string(), identity);
            }
        }
        self.correlation.write_attributes(&mut attributes);
        attributes
    }

    /// Encode the body.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the content cannot be serialized.
    pub fn encode_body(&self, envelope: bool) -> Result<String, serde_json::Error> {
        if envelope {
            serde_json::to_string(self)
        } else {
            serde_json::to_string(&self.content)
        }
    }

    /// Decode a delivered body.
    ///
    /// Accepts the full envelope or bare content. Bodies that are not JSON
    /// become a JSON string. Metadata missing from the body is recovered from
    /// `attributes`, and synthesized when absent there too.
    #[must_use]
    pub fn decode(body: &str, attributes: &MessageAttributes) -> Self {
        if let Ok(message) = serde_json::from_str::<Self>(body) {
            return message;
        }

        let content = serde_json::from_str(body)
            .unwrap_or_else(|_| serde_json::Value::String(body.to_string()));
        let id = attributes
            .get(MESSAGE_ID)
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);
        let published_at = attributes
            .get(PUBLISHED_AT)
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map_or_else(Utc::now, |at| at.with_timezone(&Utc));
        let identity = attributes
            .get(IDENTITY)
            .and_then(|identity| serde_json::from_str(identity).ok())
            .unwrap_or_default();

        Self {
            id,
            topic: attributes.get(TOPIC).cloned().unwrap_or_default(),
            content,
            published_at,
            correlation: Correlation::from_attributes(attributes),
            identity,
        }
    }
}

/// Terminal decision a handler can force on a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stop retrying and leave the message on the queue for broker redelivery.
    Aborted,
    /// Stop retrying and route to the dead-letter queue.
    Failed,
    /// Delete the message without running further handlers.
    Ignored,
}

const UNSET: u8 = 0;
const ABORTED: u8 = 1;
const FAILED: u8 = 2;
const IGNORED: u8 = 3;

/// Per-delivery control state.
///
/// Created fresh for every delivery and discarded after its terminal action.
/// The disposition can be set once; the first of [`abort`](Self::abort),
/// [`fail`](Self::fail) or [`ignore`](Self::ignore) wins.
#[derive(Debug)]
pub struct MessageArgs {
    retry_attempts: AtomicU32,
    disposition: AtomicU8,
    raw: String,
    receipt_handle: String,
    attributes: MessageAttributes,
    receive_count: u32,
}

impl MessageArgs {
    /// Control state for one delivery.
    #[must_use]
    pub fn new(
        raw: impl Into<String>,
        receipt_handle: impl Into<String>,
        attributes: MessageAttributes,
        receive_count: u32,
    ) -> Self {
        Self {
            retry_attempts: AtomicU32::new(0),
            disposition: AtomicU8::new(UNSET),
            raw: raw.into(),
            receipt_handle: receipt_handle.into(),
            attributes,
            receive_count,
        }
    }

    /// Failed handler invocations so far for this delivery.
    #[must_use]
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::SeqCst)
    }

    /// Count a failed invocation and return the new total.
    ///
    /// Called by the consumer loop.
    pub fn record_failure(&self) -> u32 {
        self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Original wire body.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Broker token for deleting or extending this delivery.
    #[must_use]
    pub fn receipt_handle(&self) -> &str {
        &self.receipt_handle
    }

    /// Attributes delivered with the message.
    #[must_use]
    pub const fn attributes(&self) -> &MessageAttributes {
        &self.attributes
    }

    /// How many times the broker has delivered this message, if it reports it.
    #[must_use]
    pub const fn receive_count(&self) -> u32 {
        self.receive_count
    }

    /// Stop retrying; the message stays on the queue. Returns `false` if a
    /// disposition was already set.
    pub fn abort(&self) -> bool {
        self.set(ABORTED)
    }

    /// Stop retrying and dead-letter the message. Returns `false` if a
    /// disposition was already set.
    pub fn fail(&self) -> bool {
        self.set(FAILED)
    }

    /// Delete the message and skip remaining handlers. Returns `false` if a
    /// disposition was already set.
    pub fn ignore(&self) -> bool {
        self.set(IGNORED)
    }

    /// Whether [`abort`](Self::abort) took effect.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.disposition() == Some(Disposition::Aborted)
    }

    /// Whether [`fail`](Self::fail) took effect.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.disposition() == Some(Disposition::Failed)
    }

    /// Whether [`ignore`](Self::ignore) took effect.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.disposition() == Some(Disposition::Ignored)
    }

    /// The disposition set by a handler, if any.
    #[must_use]
    pub fn disposition(&self) -> Option<Disposition> {
        match self.disposition.load(Ordering::SeqCst) {
            ABORTED => Some(Disposition::Aborted),
            FAILED => Some(Disposition::Failed),
            IGNORED => Some(Disposition::Ignored),
            _ => None,
        }
    }

    fn set(&self, value: u8) -> bool {
        self.disposition
            .compare_exchange(UNSET, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    /// Correlation request id generated for the publish call.
    pub request_id: Uuid,
    /// Broker-assigned message id.
    pub message_id: String,
}
