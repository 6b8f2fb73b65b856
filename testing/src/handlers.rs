//! Ready-made message handlers for tests.
//!
//! Every handler counts its invocations so tests can assert on retries.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use courier_core::handler::{HandlerResult, MessageHandler};
use courier_core::message::{Message, MessageArgs};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Records every message it sees and succeeds.
#[derive(Default)]
pub struct Recording {
    messages: Mutex<Vec<Message>>,
    topic: Option<String>,
}

impl Recording {
    /// Accept every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept only messages published to `topic`.
    #[must_use]
    pub fn only_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Invocations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Messages seen, in invocation order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn can_process(&self, message: &Message, _args: &MessageArgs) -> bool {
        self.topic.as_ref().is_none_or(|topic| *topic == message.topic)
    }

    async fn process_message(&self, message: &Message, _args: &MessageArgs) -> HandlerResult {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Fails every invocation.
#[derive(Default)]
pub struct AlwaysFails {
    calls: AtomicUsize,
}

impl AlwaysFails {
    /// Create the handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invocations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    async fn process_message(&self, _message: &Message, _args: &MessageArgs) -> HandlerResult {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(anyhow::anyhow!("failure on attempt {attempt}"))
    }
}

/// Fails the first `n` invocations, then succeeds.
pub struct FailsTimes {
    failures: usize,
    calls: AtomicUsize,
}

impl FailsTimes {
    /// Fail `failures` times before succeeding.
    #[must_use]
    pub const fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    /// Invocations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FailsTimes {
    fn name(&self) -> &str {
        "fails-times"
    }

    async fn process_message(&self, _message: &Message, _args: &MessageArgs) -> HandlerResult {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(anyhow::anyhow!("transient failure {attempt} of {}", self.failures));
        }
        Ok(())
    }
}

/// Wraps a closure.
pub struct FnHandler<F> {
    f: F,
    calls: AtomicUsize,
}

impl<F> FnHandler<F> {
    /// Handler calling `f` for every message.
    pub const fn new(f: F) -> Self
    where
        F: Fn(&Message, &MessageArgs) -> HandlerResult + Send + Sync,
    {
        Self {
            f,
            calls: AtomicUsize::new(0),
        }
    }

    /// Invocations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message, &MessageArgs) -> HandlerResult + Send + Sync,
{
    fn name(&self) -> &str {
        "fn-handler"
    }

    async fn process_message(&self, message: &Message, args: &MessageArgs) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(message, args)
    }
}

/// Sleeps for a fixed time and tracks how many invocations overlap.
pub struct Slow {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Slow {
    /// Take `delay` per message.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Highest number of simultaneous invocations seen.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Completed invocations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn process_message(&self, _message: &Message, _args: &MessageArgs) -> HandlerResult {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
