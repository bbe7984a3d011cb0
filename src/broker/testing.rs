//! Test doubles shared by the unit tests of several modules.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{
    ConsumerKey, EmbeddedLogBroker, LogBroker, Message, MessageId, OutboundMessage, ReadPosition,
    SubscriptionMode, TopicStats,
};
use crate::utils::error::BrokerError;

/// An embedded broker that records the size of every published batch. It can
/// be told to hang on publish, or to refuse one position of the next batch.
#[derive(Debug)]
pub(crate) struct RecordingBroker {
    pub inner: EmbeddedLogBroker,
    batches: Mutex<Vec<usize>>,
    stall: AtomicBool,
    reject_at: Mutex<Option<usize>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self {
            inner: EmbeddedLogBroker::temporary(None).expect("temporary broker"),
            batches: Mutex::new(Vec::new()),
            stall: AtomicBool::new(false),
            reject_at: Mutex::new(None),
        }
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    pub fn stall_publish(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    /// The message at `index` of the next batch is refused; the rest are stored.
    pub fn reject_next_at(&self, index: usize) {
        *self.reject_at.lock().unwrap() = Some(index);
    }
}

#[async_trait]
impl LogBroker for RecordingBroker {
    fn service_url(&self) -> &str {
        self.inner.service_url()
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.inner.ensure_topic(topic).await
    }

    async fn publish_batch(
        &self,
        topic: &str,
        batch: Vec<OutboundMessage>,
    ) -> Result<Vec<Result<MessageId, BrokerError>>, BrokerError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.batches.lock().unwrap().push(batch.len());
        let reject_at = self.reject_at.lock().unwrap().take();
        match reject_at {
            Some(index) if index < batch.len() => {
                let mut batch = batch;
                batch.remove(index);
                let mut results = self.inner.publish_batch(topic, batch).await?;
                results.insert(
                    index,
                    Err(BrokerError::Rejected(format!("message {index} refused"))),
                );
                Ok(results)
            }
            _ => self.inner.publish_batch(topic, batch).await,
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        ack_timeout: Duration,
    ) -> Result<ConsumerKey, BrokerError> {
        self.inner
            .subscribe(topic, subscription, mode, ack_timeout)
            .await
    }

    async fn unsubscribe(&self, key: &ConsumerKey) -> Result<(), BrokerError> {
        self.inner.unsubscribe(key).await
    }

    async fn receive(
        &self,
        key: &ConsumerKey,
        wait: Duration,
    ) -> Result<Option<Message>, BrokerError> {
        self.inner.receive(key, wait).await
    }

    async fn acknowledge(&self, key: &ConsumerKey, id: MessageId) -> Result<(), BrokerError> {
        self.inner.acknowledge(key, id).await
    }

    async fn resolve_position(
        &self,
        topic: &str,
        position: ReadPosition,
    ) -> Result<ReadPosition, BrokerError> {
        self.inner.resolve_position(topic, position).await
    }

    async fn read(
        &self,
        topic: &str,
        position: ReadPosition,
        wait: Duration,
    ) -> Result<Option<Message>, BrokerError> {
        self.inner.read(topic, position, wait).await
    }

    async fn topic_stats(&self, topic: &str) -> Result<TopicStats, BrokerError> {
        self.inner.topic_stats(topic).await
    }
}
