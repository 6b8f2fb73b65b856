//! Correlation propagation across publish/consume boundaries.
//!
//! Every message carries a trace, span, request and session identifier. The
//! identifiers travel as message attributes (never in the body), so a consumer
//! can resume the same logical trace without understanding the payload.
//!
//! The current correlation is task-local. Code running outside any scope still
//! gets a fully populated correlation: one is synthesized from fresh UUIDs.
//!
//! ```
//! use courier_core::correlation::Correlation;
//!
//! # tokio_test::block_on(async {
//! let inbound = Correlation::new();
//! let seen = inbound
//!     .scope(async { Correlation::current_or_new() })
//!     .await;
//! assert_eq!(seen, inbound);
//!
//! // Outside a scope a fresh correlation is synthesized.
//! assert!(Correlation::current().is_none());
//! # });
//! ```

use crate::message::MessageAttributes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

/// Attribute key carrying the trace id.
pub const TRACE_ID: &str = "courier-trace-id";
/// Attribute key carrying the span id.
pub const SPAN_ID: &str = "courier-span-id";
/// Attribute key carrying the request id.
pub const REQUEST_ID: &str = "courier-request-id";
/// Attribute key carrying the session id.
pub const SESSION_ID: &str = "courier-session-id";

tokio::task_local! {
    static CURRENT: Correlation;
}

/// Correlation identifiers attached to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    /// Identifies the whole causal chain.
    pub trace_id: Uuid,
    /// Identifies one hop within the chain.
    pub span_id: Uuid,
    /// Identifies the publish call that produced the message.
    pub request_id: Uuid,
    /// Identifies the user or system session that started the chain.
    pub session_id: Uuid,
}

impl Default for Correlation {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlation {
    /// A correlation made of four independently generated identifiers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        }
    }

    /// The correlation of the enclosing [`scope`](Self::scope), if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|correlation| *correlation).ok()
    }

    /// The enclosing correlation, or a freshly synthesized one.
    #[must_use]
    pub fn current_or_new() -> Self {
        Self::current().unwrap_or_default()
    }

    /// Correlation for the next hop: same trace and session, new span and request.
    #[must_use]
    pub fn next_hop(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            session_id: self.session_id,
        }
    }

    /// Run `future` with `self` as the current correlation.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }

    /// Write the identifiers into a message attribute map.
    pub fn write_attributes(&self, attributes: &mut MessageAttributes) {
        attributes.insert(TRACE_ID.to_string(), self.trace_id.to_string());
        attributes.insert(SPAN_ID.to_string(), self.span_id.to_string());
        attributes.insert(REQUEST_ID.to_string(), self.request_id.to_string());
        attributes.insert(SESSION_ID.to_string(), self.session_id.to_string());
    }

    /// Read identifiers from message attributes.
    ///
    /// Missing, malformed or nil identifiers are replaced by fresh ones, so the
    /// result is always fully populated.
    #[must_use]
    pub fn from_attributes(attributes: &MessageAttributes) -> Self {
        let read = |key: &str| {
            attributes
                .get(key)
                .and_then(|value| Uuid::parse_str(value).ok())
                .filter(|id| !id.is_nil())
                .unwrap_or_else(Uuid::new_v4)
        };
        Self {
            trace_id: read(TRACE_ID),
            span_id: read(SPAN_ID),
            request_id: read(REQUEST_ID),
            session_id: read(SESSION_ID),
        }
    }

    /// Whether every identifier is non-nil.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !(self.trace_id.is_nil()
            || self.span_id.is_nil()
            || self.request_id.is_nil()
            || self.session_id.is_nil())
    }
}

/// Source of correlation for outbound messages.
///
/// The publisher asks for one correlation per publish call. The default
/// implementation continues the current task-local trace.
pub trait CorrelationSource: Send + Sync {
    /// Correlation to stamp on the next outbound message.
    fn next(&self) -> Correlation;
}

/// Continues the task-local correlation, synthesizing one when none is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLocalCorrelation;

impl CorrelationSource for TaskLocalCorrelation {
    fn next(&self) -> Correlation {
        Correlation::current().map_or_else(Correlation::new, |current| current.next_hop())
    }
}
