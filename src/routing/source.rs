use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::{Message, QueueBroker};
use crate::consumer::SubscriptionConsumer;
use crate::routing::route::{Envelope, ProcessOutcome};
use crate::utils::error::{BrokerError, RouteError};

/// What a route run produced, as reported back to an inbound caller.
pub type RouteResult = Result<ProcessOutcome, RouteError>;

/// How a pulled item is settled with its source once the route is done.
#[derive(Debug)]
pub enum Settlement {
    /// Acknowledge on the subscription.
    Message(Message),
    /// Ack or nack on the queue.
    Delivery(u64),
    /// Answer the waiting inbound caller.
    Reply(oneshot::Sender<RouteResult>),
    /// Nothing to settle.
    None,
}

#[derive(Debug)]
pub struct SourceItem {
    pub envelope: Envelope,
    pub settlement: Settlement,
}

/// Where a route pulls messages from.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    fn describe(&self) -> String;

    /// Next item, waiting at most `wait`.
    async fn next(&self, wait: Duration) -> Result<Option<SourceItem>, BrokerError>;

    /// Confirms a processed item. A failed route run leaves the item for
    /// redelivery where the source supports it.
    async fn settle(&self, settlement: Settlement, result: &RouteResult) -> Result<(), BrokerError>;

    /// Releases whatever the source holds on the broker.
    async fn close(&self) {}
}

/// Pulls from a subscription consumer; the broker redelivers anything not
/// acknowledged after the ack timeout.
#[derive(Debug)]
pub struct SubscriptionSource {
    consumer: Arc<SubscriptionConsumer>,
}

impl SubscriptionSource {
    pub fn new(consumer: Arc<SubscriptionConsumer>) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl MessageSource for SubscriptionSource {
    fn describe(&self) -> String {
        format!(
            "subscription:{}/{}",
            self.consumer.topic(),
            self.consumer.subscription()
        )
    }

    async fn next(&self, wait: Duration) -> Result<Option<SourceItem>, BrokerError> {
        Ok(self.consumer.receive(wait).await?.map(|message| SourceItem {
            envelope: Envelope::from_message(&message),
            settlement: Settlement::Message(message),
        }))
    }

    async fn settle(&self, settlement: Settlement, result: &RouteResult) -> Result<(), BrokerError> {
        let Settlement::Message(message) = settlement else {
            return Ok(());
        };
        match result {
            Ok(_) => self.consumer.acknowledge(&message).await,
            Err(e) => {
                warn!(
                    "Leaving {}/{} for redelivery: {}",
                    message.topic(),
                    message.id(),
                    e
                );
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.consumer.stop(Duration::ZERO).await;
    }
}

/// Consumes a queue; failed runs are nacked back to the head of the queue.
#[derive(Debug)]
pub struct QueueSource {
    broker: Arc<dyn QueueBroker>,
    queue: String,
}

impl QueueSource {
    pub fn new(broker: Arc<dyn QueueBroker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl MessageSource for QueueSource {
    fn describe(&self) -> String {
        format!("queue:{}", self.queue)
    }

    async fn next(&self, wait: Duration) -> Result<Option<SourceItem>, BrokerError> {
        Ok(self
            .broker
            .consume(&self.queue, wait)
            .await?
            .map(|delivery| SourceItem {
                envelope: Envelope::from_delivery(&delivery),
                settlement: Settlement::Delivery(delivery.tag),
            }))
    }

    async fn settle(&self, settlement: Settlement, result: &RouteResult) -> Result<(), BrokerError> {
        let Settlement::Delivery(tag) = settlement else {
            return Ok(());
        };
        match result {
            Ok(_) => self.broker.ack(&self.queue, tag).await,
            Err(_) => self.broker.nack(&self.queue, tag, true).await,
        }
    }
}

struct InboundRequest {
    envelope: Envelope,
    reply: oneshot::Sender<RouteResult>,
}

/// Requests handed in by the ingress under a named endpoint. Each caller
/// waits for the outcome of its own message.
pub struct InboundSource {
    endpoint: String,
    rx: Mutex<mpsc::Receiver<InboundRequest>>,
}

/// Submission side of an [`InboundSource`].
#[derive(Clone)]
pub struct InboundHandle {
    endpoint: String,
    tx: mpsc::Sender<InboundRequest>,
}

impl InboundSource {
    /// Creates the endpoint; at most `capacity` requests wait unprocessed.
    pub fn channel(endpoint: impl Into<String>, capacity: usize) -> (Self, InboundHandle) {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            endpoint: endpoint.clone(),
            rx: Mutex::new(rx),
        };
        (source, InboundHandle { endpoint, tx })
    }
}

impl std::fmt::Debug for InboundSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InboundSource({})", self.endpoint)
    }
}

impl std::fmt::Debug for InboundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InboundHandle({})", self.endpoint)
    }
}

impl InboundHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hands `envelope` to the route and waits for its outcome.
    pub async fn submit(&self, envelope: Envelope) -> RouteResult {
        let closed = || RouteError::Setup(format!("inbound endpoint '{}' is closed", self.endpoint));
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InboundRequest { envelope, reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

#[async_trait]
impl MessageSource for InboundSource {
    fn describe(&self) -> String {
        format!("inbound:{}", self.endpoint)
    }

    async fn next(&self, wait: Duration) -> Result<Option<SourceItem>, BrokerError> {
        let mut rx = self.rx.lock().await;
        match timeout(wait, rx.recv()).await {
            Ok(Some(request)) => Ok(Some(SourceItem {
                envelope: request.envelope,
                settlement: Settlement::Reply(request.reply),
            })),
            Ok(None) => Err(BrokerError::Unavailable(format!(
                "inbound endpoint '{}' has no submitters left",
                self.endpoint
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn settle(&self, settlement: Settlement, result: &RouteResult) -> Result<(), BrokerError> {
        if let Settlement::Reply(reply) = settlement {
            if reply.send(result.clone()).is_err() {
                debug!("Caller of '{}' went away before the reply", self.endpoint);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut rx = self.rx.lock().await;
        rx.close();
        // answer whoever is still queued
        while let Ok(request) = rx.try_recv() {
            let _ = request.reply.send(Err(RouteError::Setup(format!(
                "inbound endpoint '{}' is closed",
                self.endpoint
            ))));
        }
    }
}
