//! Resource descriptors: topics, queues and their delivery policy.
//!
//! These are immutable values naming broker-side resources. They carry no
//! handles and perform no I/O; the provisioning layer turns them into
//! broker resources.
//!
//! # Example
//!
//! ```
//! use courier_core::resource::{Queue, RetryPolicy, Topic};
//! use std::time::Duration;
//!
//! let topic = Topic::new("booking-created");
//! let queue = Queue::new("booking-notifications")
//!     .with_retry_policy(RetryPolicy::new(Duration::from_secs(2), true, 5))
//!     .with_dead_letter_queue(true);
//!
//! assert_eq!(topic.name(), "booking-created");
//! assert_eq!(queue.retry_policy().delay_for_attempt(3), Duration::from_secs(6));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Suffix the broker requires on FIFO topic and queue names.
pub const FIFO_SUFFIX: &str = ".fifo";

/// Suffix appended to a queue's base name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = "-dlq";

/// A named publish destination.
///
/// Identity is the name. A topic whose name ends in `.fifo` is provisioned
/// as a FIFO topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    name: String,
}

impl Topic {
    /// Create a topic descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Logical (un-namespaced) topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this topic must be provisioned as FIFO.
    #[must_use]
    pub fn is_fifo(&self) -> bool {
        self.name.ends_with(FIFO_SUFFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A named durable buffer with its own retry policy.
///
/// Two queues with the same name are the same queue, whatever their policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    name: String,
    retry_policy: RetryPolicy,
    enable_dlq: bool,
    fifo: bool,
}

impl Queue {
    /// Create a standard queue with the default retry policy and no DLQ.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: RetryPolicy::default(),
            enable_dlq: false,
            fifo: false,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Enable or disable dead-letter routing for this queue.
    #[must_use]
    pub const fn with_dead_letter_queue(mut self, enable_dlq: bool) -> Self {
        self.enable_dlq = enable_dlq;
        self
    }

    /// Mark the queue as FIFO.
    #[must_use]
    pub const fn fifo(mut self, fifo: bool) -> Self {
        self.fifo = fifo;
        self
    }

    /// Logical (un-namespaced) queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery policy applied by consumers of this queue.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Whether exhausted or failed messages are forwarded to a dead-letter queue.
    #[must_use]
    pub const fn enable_dlq(&self) -> bool {
        self.enable_dlq
    }

    /// Whether this is a FIFO queue.
    #[must_use]
    pub const fn is_fifo(&self) -> bool {
        self.fifo
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Queue {}

impl Hash for Queue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Retry policy for handler failures.
///
/// A pure value: given the attempt number it yields the delay before the
/// next handler invocation.
///
/// # Default Values
///
/// - `delay`: 1 second
/// - `back_off`: false
/// - `max_retries`: 300
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    delay: Duration,
    back_off: bool,
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            back_off: false,
            max_retries: 300,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    ///
    /// `max_retries` bounds the total number of handler invocations for one
    /// delivered message. The handler always runs at least once, so with
    /// `max_retries` set to `0` a failed delivery still records one attempt
    /// and gives up without retrying.
    #[must_use]
    pub const fn new(delay: Duration, back_off: bool, max_retries: u32) -> Self {
        Self {
            delay,
            back_off,
            max_retries,
        }
    }

    /// Create a new policy builder starting from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            delay: None,
            back_off: None,
            max_retries: None,
        }
    }

    /// Base delay between attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the delay grows linearly with the attempt number.
    #[must_use]
    pub const fn back_off(&self) -> bool {
        self.back_off
    }

    /// Maximum handler invocations per delivery.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the `attempt`-th retry (1-based).
    ///
    /// Constant `delay` without back-off, `delay * attempt` with it.
    /// Attempt `0` is treated as `1`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.back_off {
            self.delay.saturating_mul(attempt.max(1))
        } else {
            self.delay
        }
    }

    /// Whether another invocation is allowed after `failures` failed ones.
    ///
    /// Never true when `max_retries` is `0`.
    #[must_use]
    pub const fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_retries
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    delay: Option<Duration>,
    back_off: Option<bool>,
    max_retries: Option<u32>,
}

impl RetryPolicyBuilder {
    /// Set the base delay.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Enable or disable linear back-off.
    #[must_use]
    pub const fn back_off(mut self, back_off: bool) -> Self {
        self.back_off = Some(back_off);
        self
    }

    /// Set the maximum number of invocations.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            delay: self.delay.unwrap_or(defaults.delay),
            back_off: self.back_off.unwrap_or(defaults.back_off),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
        }
    }
}

/// Prefix applied to every physical topic and queue name.
///
/// With prefix `staging`, the queue `bookings` becomes `staging-bookings`
/// on the broker. FIFO queues always end in `.fifo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace(Option<String>);

impl Namespace {
    /// A namespace that prefixes names with `prefix-`.
    ///
    /// An empty prefix is treated as no namespace.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            Self(None)
        } else {
            Self(Some(prefix))
        }
    }

    /// No prefix.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// The prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Physical name of a topic.
    #[must_use]
    pub fn topic_name(&self, topic: &Topic) -> String {
        self.apply(topic.name(), topic.is_fifo())
    }

    /// Physical name of a queue.
    #[must_use]
    pub fn queue_name(&self, queue: &Queue) -> String {
        self.apply(queue.name(), queue.is_fifo())
    }

    /// Physical name of a queue's dead-letter queue.
    #[must_use]
    pub fn dead_letter_name(&self, queue: &Queue) -> String {
        let base = queue
            .name()
            .strip_suffix(FIFO_SUFFIX)
            .unwrap_or_else(|| queue.name());
        self.apply(&format!("{base}{DEAD_LETTER_SUFFIX}"), queue.is_fifo())
    }

    fn apply(&self, name: &str, fifo: bool) -> String {
        let mut physical = match &self.0 {
            Some(prefix) => format!("{prefix}-{name}"),
            None => name.to_string(),
        };
        if fifo && !physical.ends_with(FIFO_SUFFIX) {
            physical.push_str(FIFO_SUFFIX);
        }
        physical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(), Duration::from_secs(1));
        assert!(!policy.back_off());
        assert_eq!(policy.max_retries(), 300);
    }

    #[test]
    fn builder_overrides_only_what_is_set() {
        let policy = RetryPolicy::builder().max_retries(5).build();
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.delay(), Duration::from_secs(1));
        assert!(!policy.back_off());
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let policy = RetryPolicy::new(Duration::from_millis(250), true, 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
    }

    #[test]
    fn allows_retry_until_max() {
        let policy = RetryPolicy::new(Duration::from_secs(1), false, 3);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn zero_max_retries_allows_no_retry() {
        let policy = RetryPolicy::new(Duration::from_secs(1), false, 0);
        assert!(!policy.allows_retry(0));
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn queues_are_identified_by_name() {
        let a = Queue::new("orders").with_dead_letter_queue(true);
        let b = Queue::new("orders").fifo(true);
        assert_eq!(a, b);
        assert_ne!(a, Queue::new("payments"));
    }

    #[test]
    fn namespace_prefixes_names() {
        let ns = Namespace::new("staging");
        assert_eq!(ns.topic_name(&Topic::new("booking-created")), "staging-booking-created");
        assert_eq!(ns.queue_name(&Queue::new("emails")), "staging-emails");
    }

    #[test]
    fn empty_namespace_is_no_namespace() {
        assert_eq!(Namespace::new("  "), Namespace::none());
        assert_eq!(Namespace::none().queue_name(&Queue::new("emails")), "emails");
    }

    #[test]
    fn fifo_queue_names_get_suffix_once() {
        let ns = Namespace::none();
        assert_eq!(ns.queue_name(&Queue::new("tours").fifo(true)), "tours.fifo");
        assert_eq!(ns.queue_name(&Queue::new("tours.fifo").fifo(true)), "tours.fifo");
    }

    #[test]
    fn dead_letter_names_respect_fifo() {
        let ns = Namespace::new("prod");
        assert_eq!(ns.dead_letter_name(&Queue::new("emails")), "prod-emails-dlq");
        assert_eq!(
            ns.dead_letter_name(&Queue::new("tours.fifo").fifo(true)),
            "prod-tours-dlq.fifo"
        );
    }

    #[test]
    fn topic_fifo_follows_name() {
        assert!(Topic::new("ledger.fifo").is_fifo());
        assert!(!Topic::new("ledger").is_fifo());
    }

    proptest! {
        #[test]
        fn back_off_delay_is_linear(delay_ms in 1u64..10_000, attempt in 1u32..500) {
            let policy = RetryPolicy::new(Duration::from_millis(delay_ms), true, 500);
            prop_assert_eq!(
                policy.delay_for_attempt(attempt),
                Duration::from_millis(delay_ms) * attempt
            );
        }

        #[test]
        fn constant_delay_ignores_attempt(delay_ms in 0u64..10_000, attempt in 0u32..500) {
            let policy = RetryPolicy::new(Duration::from_millis(delay_ms), false, 500);
            prop_assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(delay_ms));
        }
    }
}
