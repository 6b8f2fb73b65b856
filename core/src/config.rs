//! Configuration for the messaging layer.
//!
//! Loads configuration from environment variables with sensible defaults.
//! A `.env` file in the working directory is read first when present.
//!
//! | Variable | Default |
//! |---|---|
//! | `COURIER_QUEUE_NAME` | `courier-default` |
//! | `COURIER_TOPIC_NAME` | `courier-default` |
//! | `COURIER_NAMESPACE` | (none) |
//! | `AWS_REGION` | `us-east-1` |
//! | `COURIER_AWS_ENDPOINT` | (none) |
//! | `COURIER_MAX_CONCURRENCY` | `10` |
//! | `COURIER_WAIT_TIME_SECONDS` | `20` |
//! | `COURIER_VISIBILITY_TIMEOUT_SECONDS` | `600` |
//! | `COURIER_ERROR_PAUSE_SECONDS` | `5` |
//! | `COURIER_QUEUE_PUBLISH_DELAY_SECONDS` | `5` |

use crate::resource::Namespace;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Longest long-poll wait the broker accepts.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Longest visibility timeout the broker accepts (12 hours).
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(43_200);

/// Longest delivery delay the broker accepts (15 minutes).
pub const MAX_DELIVERY_DELAY: Duration = Duration::from_secs(900);

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but unusable
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Default queue name
    pub queue_name: String,
    /// Default topic name
    pub topic_name: String,
    /// Prefix for every topic and queue name
    pub namespace: Option<String>,
    /// Broker connection
    pub aws: AwsConfig,
    /// Consumer loop settings
    pub consumer: ConsumerConfig,
    /// Publisher settings
    pub publisher: PublisherConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    pub region: String,
    /// Endpoint override for local or test brokers
    pub endpoint_url: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
        }
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum handler invocations in flight per queue, and batch size per poll
    pub max_concurrency: usize,
    /// Long-poll wait per receive
    pub wait_time: Duration,
    /// Visibility timeout requested on receive
    pub visibility_timeout: Duration,
    /// Pause after an error escapes the poll/dispatch cycle
    pub error_pause: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            wait_time: MAX_WAIT_TIME,
            visibility_timeout: Duration::from_secs(600),
            error_pause: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    /// Set the concurrency ceiling (at least 1).
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Set the long-poll wait (capped at 20 seconds).
    #[must_use]
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time.min(MAX_WAIT_TIME);
        self
    }

    /// Set the visibility timeout (capped at 12 hours).
    #[must_use]
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout.min(MAX_VISIBILITY_TIMEOUT);
        self
    }

    /// Set the pause after loop-level errors.
    #[must_use]
    pub const fn with_error_pause(mut self, error_pause: Duration) -> Self {
        self.error_pause = error_pause;
        self
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Delay applied to messages sent directly to a queue
    pub queue_delivery_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_delivery_delay: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    /// Set the queue delivery delay (capped at 15 minutes).
    #[must_use]
    pub fn with_queue_delivery_delay(mut self, delay: Duration) -> Self {
        self.queue_delivery_delay = delay.min(MAX_DELIVERY_DELAY);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_name: "courier-default".to_string(),
            topic_name: "courier-default".to_string(),
            namespace: None,
            aws: AwsConfig::default(),
            consumer: ConsumerConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to their defaults; out-of-range values
    /// are clamped.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::lenient(|key| env::var(key).ok())
    }

    /// Load configuration from environment variables, rejecting bad values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable or out-of-range values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Strictly load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable or out-of-range values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_concurrency: usize =
            strict(&lookup, "COURIER_MAX_CONCURRENCY", defaults.consumer.max_concurrency)?;
        if max_concurrency == 0 {
            return Err(invalid("COURIER_MAX_CONCURRENCY", "0", "must be at least 1"));
        }
        let wait_time = strict_secs(
            &lookup,
            "COURIER_WAIT_TIME_SECONDS",
            defaults.consumer.wait_time,
            MAX_WAIT_TIME,
        )?;
        let visibility_timeout = strict_secs(
            &lookup,
            "COURIER_VISIBILITY_TIMEOUT_SECONDS",
            defaults.consumer.visibility_timeout,
            MAX_VISIBILITY_TIMEOUT,
        )?;
        let error_pause = strict_secs(
            &lookup,
            "COURIER_ERROR_PAUSE_SECONDS",
            defaults.consumer.error_pause,
            Duration::MAX,
        )?;
        let queue_delivery_delay = strict_secs(
            &lookup,
            "COURIER_QUEUE_PUBLISH_DELAY_SECONDS",
            defaults.publisher.queue_delivery_delay,
            MAX_DELIVERY_DELAY,
        )?;

        Ok(Self {
            consumer: ConsumerConfig {
                max_concurrency,
                wait_time,
                visibility_timeout,
                error_pause,
            },
            publisher: PublisherConfig {
                queue_delivery_delay,
            },
            ..Self::names(&lookup)
        })
    }

    fn lenient<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.parse().ok())
                .map_or(default, Duration::from_secs)
        };
        Self {
            consumer: ConsumerConfig::default()
                .with_max_concurrency(
                    lookup("COURIER_MAX_CONCURRENCY")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.consumer.max_concurrency),
                )
                .with_wait_time(secs("COURIER_WAIT_TIME_SECONDS", defaults.consumer.wait_time))
                .with_visibility_timeout(secs(
                    "COURIER_VISIBILITY_TIMEOUT_SECONDS",
                    defaults.consumer.visibility_timeout,
                ))
                .with_error_pause(secs("COURIER_ERROR_PAUSE_SECONDS", defaults.consumer.error_pause)),
            publisher: PublisherConfig::default().with_queue_delivery_delay(secs(
                "COURIER_QUEUE_PUBLISH_DELAY_SECONDS",
                defaults.publisher.queue_delivery_delay,
            )),
            ..Self::names(&lookup)
        }
    }

    fn names<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            queue_name: lookup("COURIER_QUEUE_NAME").unwrap_or(defaults.queue_name),
            topic_name: lookup("COURIER_TOPIC_NAME").unwrap_or(defaults.topic_name),
            namespace: lookup("COURIER_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            aws: AwsConfig {
                region: lookup("AWS_REGION").unwrap_or(defaults.aws.region),
                endpoint_url: lookup("COURIER_AWS_ENDPOINT").filter(|url| !url.is_empty()),
            },
            ..defaults
        }
    }

    /// The namespace applied to physical resource names.
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace.clone().map_or_else(Namespace::none, Namespace::new)
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn strict<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn strict_secs<F>(lookup: &F, key: &str, default: Duration, max: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = strict(lookup, key, default.as_secs()).map(Duration::from_secs)?;
    if value > max {
        return Err(invalid(
            key,
            &value.as_secs().to_string(),
            format!("must not exceed {} seconds", max.as_secs()),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.consumer.wait_time, Duration::from_secs(20));
        assert_eq!(config.consumer.visibility_timeout, Duration::from_secs(600));
        assert_eq!(config.namespace(), Namespace::none());
    }

    #[test]
    fn reads_names_and_endpoint() {
        let config = Config::from_lookup(lookup(&[
            ("COURIER_QUEUE_NAME", "emails"),
            ("COURIER_TOPIC_NAME", "booking-created"),
            ("COURIER_NAMESPACE", "staging"),
            ("AWS_REGION", "eu-west-1"),
            ("COURIER_AWS_ENDPOINT", "http://localhost:4566"),
            ("COURIER_MAX_CONCURRENCY", "5"),
        ]))
        .unwrap();
        assert_eq!(config.queue_name, "emails");
        assert_eq!(config.topic_name, "booking-created");
        assert_eq!(config.namespace(), Namespace::new("staging"));
        assert_eq!(config.aws.region, "eu-west-1");
        assert_eq!(config.aws.endpoint_url.as_deref(), Some("http://localhost:4566"));
        assert_eq!(config.consumer.max_concurrency, 5);
    }

    #[test]
    fn strict_rejects_garbage() {
        let err = Config::from_lookup(lookup(&[("COURIER_MAX_CONCURRENCY", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "COURIER_MAX_CONCURRENCY"));
    }

    #[test]
    fn strict_rejects_zero_concurrency_and_long_waits() {
        assert!(Config::from_lookup(lookup(&[("COURIER_MAX_CONCURRENCY", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("COURIER_WAIT_TIME_SECONDS", "60")])).is_err());
        assert!(Config::from_lookup(lookup(&[("COURIER_QUEUE_PUBLISH_DELAY_SECONDS", "901")])).is_err());
    }

    #[test]
    fn lenient_falls_back_and_clamps() {
        let config = Config::lenient(lookup(&[
            ("COURIER_MAX_CONCURRENCY", "0"),
            ("COURIER_WAIT_TIME_SECONDS", "60"),
            ("COURIER_ERROR_PAUSE_SECONDS", "soon"),
        ]));
        assert_eq!(config.consumer.max_concurrency, 1);
        assert_eq!(config.consumer.wait_time, MAX_WAIT_TIME);
        assert_eq!(config.consumer.error_pause, Duration::from_secs(5));
    }
}
