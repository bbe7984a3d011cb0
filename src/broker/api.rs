//! The interfaces every broker implementation provides.
//!
//! Producers, consumers, readers and routes only talk to brokers through
//! these two traits, so an embedded broker and a networked client are
//! interchangeable.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::broker::message::{Message, MessageId, OutboundMessage, ReadPosition, SubscriptionMode};
use crate::utils::error::BrokerError;

/// Identifies one consumer attached to one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub topic: String,
    pub subscription: String,
    pub consumer: String,
}

/// Partitioned, persistent log broker.
#[async_trait]
pub trait LogBroker: Send + Sync + 'static {
    /// Where the broker lives, for logs.
    fn service_url(&self) -> &str;

    /// Creates the topic if needed; fails if the broker is unreachable.
    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Appends `batch` in order. The outer error means nothing was written;
    /// the inner results are per message.
    async fn publish_batch(
        &self,
        topic: &str,
        batch: Vec<OutboundMessage>,
    ) -> Result<Vec<Result<MessageId, BrokerError>>, BrokerError>;

    /// Attaches a consumer to `subscription`, creating it if needed.
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        ack_timeout: Duration,
    ) -> Result<ConsumerKey, BrokerError>;

    /// Detaches a consumer. Its unacknowledged messages become available to
    /// other consumers right away.
    async fn unsubscribe(&self, key: &ConsumerKey) -> Result<(), BrokerError>;

    /// Next message for this consumer, waiting at most `wait`.
    async fn receive(&self, key: &ConsumerKey, wait: Duration)
    -> Result<Option<Message>, BrokerError>;

    async fn acknowledge(&self, key: &ConsumerKey, id: MessageId) -> Result<(), BrokerError>;

    /// Turns `Latest` into a concrete position; other positions are returned as is.
    async fn resolve_position(
        &self,
        topic: &str,
        position: ReadPosition,
    ) -> Result<ReadPosition, BrokerError>;

    /// First visible message after `position`, waiting at most `wait`.
    /// Never creates subscription state.
    async fn read(
        &self,
        topic: &str,
        position: ReadPosition,
        wait: Duration,
    ) -> Result<Option<Message>, BrokerError>;

    async fn topic_stats(&self, topic: &str) -> Result<TopicStats, BrokerError>;
}

impl std::fmt::Debug for dyn LogBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogBroker({})", self.service_url())
    }
}

/// A message handed to a queue.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueMessage {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl QueueMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A message taken from a queue, held until acked or nacked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
}

/// AMQP-style queue broker.
#[async_trait]
pub trait QueueBroker: Send + Sync + 'static {
    fn address(&self) -> String;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<(), BrokerError>;

    /// Next ready message, waiting at most `wait`.
    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, queue: &str, tag: u64) -> Result<(), BrokerError>;

    /// Rejects a delivery; with `requeue` it goes back to the head of the queue.
    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError>;
}

impl std::fmt::Debug for dyn QueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueBroker({})", self.address())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub retained_messages: usize,
    pub earliest_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    /// Retained messages whose visibility time is still in the future.
    pub delayed_messages: usize,
    pub subscriptions: Vec<SubscriptionStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStats {
    pub name: String,
    pub mode: SubscriptionMode,
    pub consumers: usize,
    /// Retained messages not yet acknowledged.
    pub backlog: u64,
    /// Handed out and awaiting acknowledgement.
    pub unacked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub ready: usize,
    pub unacked: usize,
    pub published: u64,
    pub acked: u64,
}
