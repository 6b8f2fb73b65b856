//! Handler, error-handler and middleware traits.
//!
//! Application code plugs into the consumer loop through these traits. A
//! queue may have several handlers; each delivered message is offered to every
//! handler whose [`MessageHandler::can_process`] accepts it, in registration
//! order.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use courier_core::handler::{HandlerResult, MessageHandler};
//! use courier_core::message::{Message, MessageArgs};
//!
//! struct SendConfirmationEmail { /* mailer, templates */ }
//!
//! #[async_trait]
//! impl MessageHandler for SendConfirmationEmail {
//!     fn can_process(&self, message: &Message, _args: &MessageArgs) -> bool {
//!         message.topic == "booking-created"
//!     }
//!
//!     async fn process_message(&self, message: &Message, args: &MessageArgs) -> HandlerResult {
//!         let booking: BookingCreated = message.content_as()?;
//!         if booking.email.is_empty() {
//!             // Nothing will ever fix this message.
//!             args.fail();
//!             return Ok(());
//!         }
//!         self.mailer.send(&booking.email).await?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! # Idempotency
//!
//! Handlers must tolerate seeing the same message twice: a retry re-invokes
//! the handler on the same message, and broker redelivery after a visibility
//! timeout produces a new instance of a message that may already be handled.

use crate::message::{Message, MessageArgs};
use async_trait::async_trait;

/// Error returned by application handlers.
pub type HandlerError = anyhow::Error;

/// Result returned by application handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Processes delivered messages.
///
/// Returning `Err` makes the consumer retry per the queue's retry policy.
/// Handlers can short-circuit that with [`MessageArgs::abort`],
/// [`MessageArgs::fail`] or [`MessageArgs::ignore`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this handler wants the message. Defaults to every message.
    fn can_process(&self, _message: &Message, _args: &MessageArgs) -> bool {
        true
    }

    /// Process one message.
    ///
    /// # Errors
    ///
    /// Any error is treated as retryable.
    async fn process_message(&self, message: &Message, args: &MessageArgs) -> HandlerResult;
}

/// Observes handler failures.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Called after every failed handler invocation.
    async fn on_error(&self, message: &Message, args: &MessageArgs, error: &HandlerError);

    /// Called once when the consumer gives up on a message.
    async fn on_give_up(&self, _message: &Message, _args: &MessageArgs, _error: &HandlerError) {}
}

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every matching handler succeeded; the message was deleted.
    Handled,
    /// Retries were exhausted; the message was deleted.
    GaveUp,
    /// The message was forwarded to the dead-letter queue and deleted.
    DeadLettered,
    /// Forwarding to the dead-letter queue failed; the message was left on
    /// the queue for broker redrive.
    DeadLetterFailed,
    /// A handler aborted; the message was left for broker redelivery.
    Aborted,
    /// A handler ignored the message; it was deleted.
    Ignored,
    /// No handler accepted the message; it was deleted.
    Unrouted,
    /// Shutdown interrupted the retry loop; the message was left on the queue.
    Interrupted,
}

impl DeliveryOutcome {
    /// Whether the message was removed from the queue (or was meant to be).
    #[must_use]
    pub const fn deletes_message(self) -> bool {
        !matches!(self, Self::Aborted | Self::Interrupted | Self::DeadLetterFailed)
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::GaveUp => "gave_up",
            Self::DeadLettered => "dead_lettered",
            Self::DeadLetterFailed => "dead_letter_failed",
            Self::Aborted => "aborted",
            Self::Ignored => "ignored",
            Self::Unrouted => "unrouted",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Hooks around each delivery.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called once before the first handler invocation.
    async fn before(&self, _message: &Message, _args: &MessageArgs) {}

    /// Called once with the delivery's terminal outcome.
    async fn after(&self, _message: &Message, _args: &MessageArgs, _outcome: DeliveryOutcome) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_that_keep_the_message() {
        assert!(DeliveryOutcome::Handled.deletes_message());
        assert!(DeliveryOutcome::GaveUp.deletes_message());
        assert!(DeliveryOutcome::DeadLettered.deletes_message());
        assert!(DeliveryOutcome::Ignored.deletes_message());
        assert!(DeliveryOutcome::Unrouted.deletes_message());
        assert!(!DeliveryOutcome::Aborted.deletes_message());
        assert!(!DeliveryOutcome::Interrupted.deletes_message());
        assert!(!DeliveryOutcome::DeadLetterFailed.deletes_message());
    }

    #[test]
    fn outcome_labels_are_snake_case() {
        assert_eq!(DeliveryOutcome::DeadLettered.as_str(), "dead_lettered");
        assert_eq!(DeliveryOutcome::GaveUp.as_str(), "gave_up");
        assert_eq!(DeliveryOutcome::DeadLetterFailed.as_str(), "dead_letter_failed");
    }
}
