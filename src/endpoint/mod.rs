//! The `endpoint` module owns the lifecycle of producer, consumer and
//! reader handles.
//!
//! Every handle opened through the [`EndpointManager`] is registered so an
//! orderly shutdown can close all of them, letting in-flight sends finish
//! within the drain timeout and counting what had to be abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{LogBroker, ReadPosition, SubscriptionMode};
use crate::config::Settings;
use crate::consumer::SubscriptionConsumer;
use crate::producer::{Producer, ProducerConfig};
use crate::reader::PositionalReader;
use crate::utils::error::EndpointError;

/// What an endpoint does on its topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// Flushes every send on its own.
    Producer,
    /// Batches by count and delay.
    BatchProducer,
    Consumer {
        subscription: String,
        mode: SubscriptionMode,
        ack_timeout: Duration,
    },
    Reader {
        start: ReadPosition,
    },
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::BatchProducer => "batch producer",
            Self::Consumer { .. } => "consumer",
            Self::Reader { .. } => "reader",
        }
    }
}

/// Tunables applied when opening an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub producer_name: Option<String>,
    pub max_batch_messages: usize,
    pub max_batch_delay: Duration,
    pub poll_timeout: Duration,
    pub read_ahead: Duration,
}

impl EndpointConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            producer_name: settings.producer.name.clone(),
            max_batch_messages: settings.producer.max_batch_messages,
            max_batch_delay: settings.producer.max_batch_delay(),
            poll_timeout: settings.consumer.poll_timeout(),
            read_ahead: Duration::from_millis(settings.log_broker.read_ahead_ms),
        }
    }

    pub fn with_producer_name(mut self, name: impl Into<String>) -> Self {
        self.producer_name = Some(name.into());
        self
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone)]
pub enum EndpointHandle {
    Producer(Arc<Producer>),
    Consumer(Arc<SubscriptionConsumer>),
    Reader(Arc<PositionalReader>),
}

impl EndpointHandle {
    pub fn topic(&self) -> &str {
        match self {
            Self::Producer(p) => p.topic(),
            Self::Consumer(c) => c.topic(),
            Self::Reader(r) => r.topic(),
        }
    }

    pub fn as_producer(&self) -> Option<&Arc<Producer>> {
        match self {
            Self::Producer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_consumer(&self) -> Option<&Arc<SubscriptionConsumer>> {
        match self {
            Self::Consumer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_reader(&self) -> Option<&Arc<PositionalReader>> {
        match self {
            Self::Reader(r) => Some(r),
            _ => None,
        }
    }

    fn same_as(&self, other: &EndpointHandle) -> bool {
        match (self, other) {
            (Self::Producer(a), Self::Producer(b)) => Arc::ptr_eq(a, b),
            (Self::Consumer(a), Self::Consumer(b)) => Arc::ptr_eq(a, b),
            (Self::Reader(a), Self::Reader(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Closes the underlying handle; returns how much work was abandoned.
    async fn shut(&self, drain_timeout: Duration) -> usize {
        match self {
            Self::Producer(p) => p.close(drain_timeout).await,
            Self::Consumer(c) => c.stop(drain_timeout).await,
            Self::Reader(r) => {
                r.close();
                0
            }
        }
    }
}

/// Totals of an orderly shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub closed: usize,
    pub abandoned: usize,
}

/// Endpoints opened at startup from the configuration.
#[derive(Debug, Clone)]
pub struct DefaultEndpoints {
    pub producer: Arc<Producer>,
    pub batch_producer: Arc<Producer>,
    pub consumer: Arc<SubscriptionConsumer>,
    pub batch_consumer: Arc<SubscriptionConsumer>,
    pub batch_reader: Arc<PositionalReader>,
}

#[derive(Debug)]
pub struct EndpointManager {
    broker: Arc<dyn LogBroker>,
    endpoints: Mutex<Vec<EndpointHandle>>,
    shut_down: AtomicBool,
}

impl EndpointManager {
    pub fn new(broker: Arc<dyn LogBroker>) -> Self {
        Self {
            broker,
            endpoints: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &Arc<dyn LogBroker> {
        &self.broker
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Vec<EndpointHandle>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens an endpoint on `topic`. Fails with `EndpointUnavailable` when
    /// the broker cannot be reached.
    pub async fn open(
        &self,
        topic: &str,
        role: Role,
        config: &EndpointConfig,
    ) -> Result<EndpointHandle, EndpointError> {
        match role {
            Role::Producer => Ok(EndpointHandle::Producer(
                self.open_producer(topic, false, config).await?,
            )),
            Role::BatchProducer => Ok(EndpointHandle::Producer(
                self.open_producer(topic, true, config).await?,
            )),
            Role::Consumer {
                subscription,
                mode,
                ack_timeout,
            } => Ok(EndpointHandle::Consumer(
                self.open_consumer(topic, &subscription, mode, ack_timeout, config)
                    .await?,
            )),
            Role::Reader { start } => Ok(EndpointHandle::Reader(
                self.open_reader(topic, start, config).await?,
            )),
        }
    }

    async fn prepare(&self, topic: &str) -> Result<(), EndpointError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EndpointError::ShutDown);
        }
        self.broker
            .ensure_topic(topic)
            .await
            .map_err(|e| EndpointError::from_broker(topic, e))
    }

    fn register(&self, handle: EndpointHandle, role: &Role) {
        info!("Opened {} on '{}'", role.label(), handle.topic());
        self.registry().push(handle);
    }

    pub async fn open_producer(
        &self,
        topic: &str,
        batching: bool,
        config: &EndpointConfig,
    ) -> Result<Arc<Producer>, EndpointError> {
        self.prepare(topic).await?;
        let mut registry = self.registry();
        let name = producer_name(config, topic, &registry);
        let (role, producer_config) = if batching {
            (
                Role::BatchProducer,
                ProducerConfig::batched(name, config.max_batch_messages, config.max_batch_delay),
            )
        } else {
            (Role::Producer, ProducerConfig::unbatched(name))
        };
        let producer = Arc::new(Producer::spawn(
            self.broker.clone(),
            topic,
            producer_config,
        ));
        info!("Opened {} '{}' on '{}'", role.label(), producer.name(), topic);
        registry.push(EndpointHandle::Producer(producer.clone()));
        Ok(producer)
    }

    pub async fn open_consumer(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        ack_timeout: Duration,
        config: &EndpointConfig,
    ) -> Result<Arc<SubscriptionConsumer>, EndpointError> {
        self.prepare(topic).await?;
        let consumer = SubscriptionConsumer::subscribe(
            self.broker.clone(),
            topic,
            subscription,
            mode,
            ack_timeout,
            config.poll_timeout,
        )
        .await
        .map_err(|e| EndpointError::from_broker(topic, e))?;
        let consumer = Arc::new(consumer);
        let role = Role::Consumer {
            subscription: subscription.to_string(),
            mode,
            ack_timeout,
        };
        self.register(EndpointHandle::Consumer(consumer.clone()), &role);
        Ok(consumer)
    }

    pub async fn open_reader(
        &self,
        topic: &str,
        start: ReadPosition,
        config: &EndpointConfig,
    ) -> Result<Arc<PositionalReader>, EndpointError> {
        self.prepare(topic).await?;
        let reader = PositionalReader::open(self.broker.clone(), topic, start, config.read_ahead)
            .await
            .map_err(|e| EndpointError::from_broker(topic, e))?;
        let reader = Arc::new(reader);
        self.register(EndpointHandle::Reader(reader.clone()), &Role::Reader { start });
        Ok(reader)
    }

    /// Opens the configured startup set: a producer and an exclusive
    /// consumer on the events topic, a batch producer, a shared consumer and
    /// a replay reader on the batch topic.
    pub async fn open_defaults(&self, settings: &Settings) -> Result<DefaultEndpoints, EndpointError> {
        let config = EndpointConfig::from_settings(settings);
        let ack_timeout = settings.consumer.ack_timeout();
        let topic = &settings.producer.topic;
        let batch_topic = &settings.producer.batch_topic;

        Ok(DefaultEndpoints {
            producer: self.open_producer(topic, false, &config).await?,
            batch_producer: self.open_producer(batch_topic, true, &config).await?,
            consumer: self
                .open_consumer(
                    topic,
                    &settings.consumer.subscription,
                    SubscriptionMode::Exclusive,
                    ack_timeout,
                    &config,
                )
                .await?,
            batch_consumer: self
                .open_consumer(
                    batch_topic,
                    &settings.consumer.batch_subscription,
                    SubscriptionMode::Shared,
                    ack_timeout,
                    &config,
                )
                .await?,
            batch_reader: self
                .open_reader(batch_topic, settings.reader.start, &config)
                .await?,
        })
    }

    /// Closes one endpoint and forgets it. Closing an already closed handle
    /// does nothing. Returns the abandoned count.
    pub async fn close(&self, handle: &EndpointHandle, drain_timeout: Duration) -> usize {
        self.registry().retain(|h| !h.same_as(handle));
        handle.shut(drain_timeout).await
    }

    /// Closes every open endpoint within one overall drain budget. Later
    /// `open` calls fail with `EndpointError::ShutDown`.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        self.shut_down.store(true, Ordering::SeqCst);
        let handles: Vec<EndpointHandle> = std::mem::take(&mut *self.registry());
        let deadline = Instant::now() + drain_timeout;

        let mut report = ShutdownReport::default();
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            report.abandoned += handle.shut(remaining).await;
            report.closed += 1;
        }

        if report.abandoned > 0 {
            warn!(
                "Closed {} endpoints; {} in-flight units abandoned",
                report.closed, report.abandoned
            );
        } else {
            info!("Closed {} endpoints", report.closed);
        }
        report
    }

    pub fn open_count(&self) -> usize {
        self.registry().len()
    }

    pub fn producers(&self) -> Vec<Arc<Producer>> {
        self.registry()
            .iter()
            .filter_map(|h| h.as_producer().cloned())
            .collect()
    }

    pub fn consumers(&self) -> Vec<Arc<SubscriptionConsumer>> {
        self.registry()
            .iter()
            .filter_map(|h| h.as_consumer().cloned())
            .collect()
    }
}

/// The configured name goes to the first producer that asks for it. Later
/// producers get the topic appended, plus a counter if that is taken too.
fn producer_name(config: &EndpointConfig, topic: &str, open: &[EndpointHandle]) -> String {
    let Some(base) = &config.producer_name else {
        return format!("{topic}-{}", &Uuid::new_v4().simple().to_string()[..8]);
    };
    let taken = |candidate: &str| {
        open.iter()
            .filter_map(EndpointHandle::as_producer)
            .any(|p| p.name() == candidate)
    };
    if !taken(base.as_str()) {
        return base.clone();
    }
    let with_topic = format!("{base}-{topic}");
    if !taken(with_topic.as_str()) {
        return with_topic;
    }
    (2..)
        .map(|n| format!("{with_topic}-{n}"))
        .find(|candidate| !taken(candidate.as_str()))
        .unwrap_or(with_topic)
}

#[cfg(test)]
mod tests;
