use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::api::{Delivery, QueueBroker, QueueMessage, QueueStats};
use crate::config::QueueBrokerSettings;
use crate::utils::error::BrokerError;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(QueueMessage, bool)>,
    unacked: HashMap<u64, QueueMessage>,
    notify: Arc<Notify>,
    published: u64,
    acked: u64,
}

/// Queue broker kept entirely in memory, with AMQP delivery semantics:
/// a consumed message stays unacked until `ack`, and `nack` with requeue
/// puts it back at the head flagged as redelivered.
///
/// Queues are declared implicitly on first publish or consume.
#[derive(Debug)]
pub struct InMemoryQueueBroker {
    address: String,
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    connected: AtomicBool,
}

impl InMemoryQueueBroker {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        }
    }

    /// Builds a broker for the configured host. Empty credentials are refused.
    pub fn connect(settings: &QueueBrokerSettings) -> Result<Self, BrokerError> {
        if settings.username.is_empty() || settings.password.is_empty() {
            return Err(BrokerError::Rejected(format!(
                "missing credentials for amqp://{}:{}",
                settings.host, settings.port
            )));
        }
        let address = format!(
            "amqp://{}@{}:{}",
            settings.username, settings.host, settings.port
        );
        info!("Connected to queue broker {}", address);
        Ok(Self::new(address))
    }

    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Queue broker {} disconnected", self.address);
            for state in self.lock().values() {
                state.notify.notify_waiters();
            }
        }
    }

    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Queue broker {} reconnected", self.address);
        }
    }

    fn check_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable(self.address.clone()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the head of the queue, or hands back its change signal.
    fn try_take(&self, queue: &str) -> Result<Delivery, Arc<Notify>> {
        let mut queues = self.lock();
        let state = queues.entry(queue.to_string()).or_default();
        match state.ready.pop_front() {
            Some((message, redelivered)) => {
                let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
                state.unacked.insert(tag, message.clone());
                Ok(Delivery {
                    tag,
                    body: message.body,
                    headers: message.headers,
                    redelivered,
                })
            }
            None => Err(state.notify.clone()),
        }
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueueBroker {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.check_connected()?;
        self.lock().entry(queue.to_string()).or_default();
        debug!("Declared queue '{}'", queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut queues = self.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back((message, false));
        state.published += 1;
        state.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            self.check_connected()?;
            let notify = match self.try_take(queue) {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(notify) => notify,
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // a publish may have landed between the check and enable
            if let Ok(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn ack(&self, queue: &str, tag: u64) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut queues = self.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if state.unacked.remove(&tag).is_none() {
            return Err(BrokerError::Rejected(format!("unknown delivery tag {tag}")));
        }
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut queues = self.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let message = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown delivery tag {tag}")))?;
        if requeue {
            state.ready.push_front((message, true));
            state.notify.notify_waiters();
        } else {
            debug!("Discarded delivery {} from '{}'", tag, queue);
        }
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        self.check_connected()?;
        let queues = self.lock();
        let state = queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(QueueStats {
            queue: queue.to_string(),
            ready: state.ready.len(),
            unacked: state.unacked.len(),
            published: state.published,
            acked: state.acked,
        })
    }
}
