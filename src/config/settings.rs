use std::time::Duration;

use serde::Deserialize;

use crate::broker::{ReadPosition, SubscriptionMode};
use crate::routing::{MessageFormat, RetryPolicy, SinkDescriptor, SourceDescriptor};

/// Top-level configuration settings for the application.
///
/// Every section is optional in the sources; anything missing falls back to
/// `Settings::default()`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub log_broker: LogBrokerSettings,
    pub queue_broker: QueueBrokerSettings,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub reader: ReaderSettings,
    pub ingress: IngressSettings,
    pub lifecycle: LifecycleSettings,
    pub logging: LoggingSettings,
    pub routes: Vec<RouteSettings>,
}

/// Connection settings for the partitioned log broker.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogBrokerSettings {
    pub service_url: String,
    /// Directory of the embedded broker's storage.
    pub data_dir: String,
    pub auth_token: Option<String>,
    /// Oldest messages beyond this count are trimmed per topic.
    pub retention_max_messages: Option<usize>,
    pub retention_ttl_secs: Option<i64>,
    /// How long a reader waits for the next message before reporting none.
    pub read_ahead_ms: u64,
}

/// Connection settings for the queue broker.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueBrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Producer defaults, including the batching thresholds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProducerSettings {
    pub name: Option<String>,
    pub topic: String,
    pub batch_topic: String,
    pub max_batch_messages: usize,
    pub max_batch_delay_ms: u64,
}

/// Consumer defaults, including the redelivery timeout.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Exclusive subscription on the producer topic.
    pub subscription: String,
    /// Shared subscription on the batch topic.
    pub batch_subscription: String,
    pub ack_timeout_secs: u64,
    pub poll_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReaderSettings {
    pub start: ReadPosition,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngressSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Upper bound on waiting for in-flight work at shutdown.
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

/// One `[[routes]]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct RouteSettings {
    pub id: String,
    pub source: SourceDescriptor,
    pub sink: SinkDescriptor,
    #[serde(default)]
    pub dead_letter: SinkDescriptor,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            self.multiplier,
        )
    }
}

impl ProducerSettings {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }
}

impl ConsumerSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl LifecycleSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_broker: LogBrokerSettings::default(),
            queue_broker: QueueBrokerSettings::default(),
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
            reader: ReaderSettings::default(),
            ingress: IngressSettings::default(),
            lifecycle: LifecycleSettings::default(),
            logging: LoggingSettings::default(),
            routes: default_routes(),
        }
    }
}

impl Default for LogBrokerSettings {
    fn default() -> Self {
        Self {
            service_url: "embedded://localhost".to_string(),
            data_dir: "relaymq_data".to_string(),
            auth_token: None,
            retention_max_messages: Some(100_000),
            retention_ttl_secs: None,
            read_ahead_ms: 200,
        }
    }
}

impl Default for QueueBrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            name: None,
            topic: "user-events".to_string(),
            batch_topic: "batch-events".to_string(),
            max_batch_messages: 1000,
            max_batch_delay_ms: 10,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            subscription: "relaymq-subscription".to_string(),
            batch_subscription: "batch-subscription".to_string(),
            ack_timeout_secs: 30,
            poll_timeout_ms: 1000,
        }
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            start: ReadPosition::Earliest,
        }
    }
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            multiplier: 2.0,
        }
    }
}

/// Routes used when the configuration declares none: log topic to queue,
/// inbound requests to the log topic, and a queue consumer that logs.
fn default_routes() -> Vec<RouteSettings> {
    vec![
        RouteSettings {
            id: "log-to-queue".to_string(),
            source: SourceDescriptor::Subscription {
                topic: "user-events".to_string(),
                subscription: "log-to-queue".to_string(),
                mode: SubscriptionMode::Shared,
                ack_timeout_secs: None,
            },
            sink: SinkDescriptor::Queue {
                queue: "user-events".to_string(),
            },
            dead_letter: SinkDescriptor::Log,
            format: MessageFormat::Json,
            retry: RetrySettings::default(),
        },
        RouteSettings {
            id: "inbound-to-log".to_string(),
            source: SourceDescriptor::Inbound {
                endpoint: "messages".to_string(),
            },
            sink: SinkDescriptor::Topic {
                topic: "user-events".to_string(),
            },
            dead_letter: SinkDescriptor::Log,
            format: MessageFormat::Raw,
            retry: RetrySettings::default(),
        },
        RouteSettings {
            id: "queue-consumer".to_string(),
            source: SourceDescriptor::Queue {
                queue: "user-events".to_string(),
            },
            sink: SinkDescriptor::Log,
            dead_letter: SinkDescriptor::Log,
            format: MessageFormat::Json,
            retry: RetrySettings::default(),
        },
    ]
}
