use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::broker::{OutboundMessage, QueueBroker, QueueMessage};
use crate::producer::Producer;
use crate::routing::route::Envelope;
use crate::utils::error::RouteError;

/// Destination of a route, dead-letter paths included.
///
/// Errors that may clear up on their own must be reported as transient
/// (`RouteError::SinkDelivery { transient: true, .. }`); only those are retried.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    fn describe(&self) -> String;

    async fn deliver(&self, envelope: &Envelope) -> Result<(), RouteError>;
}

/// Publishes to a log topic through an unbatched producer.
#[derive(Debug, Clone)]
pub struct TopicSink {
    producer: Arc<Producer>,
}

impl TopicSink {
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Sink for TopicSink {
    fn describe(&self) -> String {
        format!("topic:{}", self.producer.topic())
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<(), RouteError> {
        let mut message =
            OutboundMessage::new(envelope.payload.clone()).properties(envelope.properties.clone());
        if let Some(key) = &envelope.key {
            message = message.key(key.clone());
        }
        self.producer.send(message).await?;
        Ok(())
    }
}

/// Publishes to a queue; message properties become headers.
#[derive(Debug, Clone)]
pub struct QueueSink {
    broker: Arc<dyn QueueBroker>,
    queue: String,
}

impl QueueSink {
    pub fn new(broker: Arc<dyn QueueBroker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl Sink for QueueSink {
    fn describe(&self) -> String {
        format!("queue:{}", self.queue)
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<(), RouteError> {
        let message =
            QueueMessage::new(envelope.payload.clone()).with_headers(envelope.properties.clone());
        self.broker.publish(&self.queue, message).await?;
        Ok(())
    }
}

/// Writes messages to the log. Never fails.
#[derive(Debug, Clone)]
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn describe(&self) -> String {
        format!("log:{}", self.label)
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<(), RouteError> {
        info!(
            "[{}] {} {:?}",
            self.label,
            String::from_utf8_lossy(&envelope.payload),
            envelope.properties
        );
        Ok(())
    }
}
