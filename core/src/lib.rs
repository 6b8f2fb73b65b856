//! # Courier Core
//!
//! Core traits and types for the Courier reliable messaging layer.
//!
//! Courier sits on top of an SQS/SNS-style broker and provides idempotent
//! resource provisioning, at-least-once publishing and a retrying,
//! concurrency-bounded consumer loop with correlation propagation. This crate
//! holds the vocabulary shared by every other crate:
//!
//! - [`resource`]: `Topic`, `Queue`, `RetryPolicy`, `Namespace`
//! - [`message`]: `Message`, `MessageArgs`, `PublishResponse`
//! - [`correlation`]: trace/span/request/session propagation
//! - [`broker`]: the `Broker` trait and its wire types
//! - [`handler`]: `MessageHandler`, `ErrorHandler`, `Middleware`
//! - [`config`]: environment configuration
//!
//! ## Data Flow
//!
//! ```text
//! domain code ──► Publisher ──► provisioning (lazy, cached) ──► broker
//!                                                                 │
//! handler ◄── retry / ack / dead-letter ◄── QueueWorker ◄── receive
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: handlers may see a message more than once
//! - **No ordering** beyond what FIFO queues give within a message group
//! - **Opaque content**: payloads are never validated

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod correlation;
pub mod handler;
pub mod message;
pub mod resource;

// Re-export commonly used types
pub use broker::{Broker, BrokerError};
pub use correlation::Correlation;
pub use handler::{DeliveryOutcome, ErrorHandler, HandlerError, HandlerResult, MessageHandler, Middleware};
pub use message::{Identity, Message, MessageArgs, PublishResponse};
pub use resource::{Namespace, Queue, RetryPolicy, Topic};
