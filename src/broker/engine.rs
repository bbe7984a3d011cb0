use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::api::{ConsumerKey, LogBroker, SubscriptionStats, TopicStats};
use crate::broker::message::{Message, MessageId, OutboundMessage, ReadPosition, SubscriptionMode};
use crate::broker::topic::{Subscription, Topic, is_visible};
use crate::config::LogBrokerSettings;
use crate::persistence::{Persistence, StoredMessage};
use crate::utils::error::BrokerError;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A log broker running inside the process on top of `sled`.
///
/// Topics are created on first use. Each message gets the next sequence of
/// its topic, and subscriptions keep their acknowledgement state on disk so
/// a restart resumes where the last run stopped.
///
/// `disconnect` and `reconnect` simulate losing the broker: while
/// disconnected every call fails with `BrokerError::Unavailable`.
pub struct EmbeddedLogBroker {
    service_url: String,
    store: Persistence,
    topics: Mutex<HashMap<String, Topic>>,
    connected: AtomicBool,
}

enum Dispatch {
    Ready(Message),
    /// Nothing to hand out; the earliest wall-clock time something may change.
    Idle(Option<i64>),
}

impl EmbeddedLogBroker {
    pub fn open(settings: &LogBrokerSettings) -> Result<Self, BrokerError> {
        let store = Persistence::open(
            &settings.data_dir,
            settings.retention_ttl_secs,
            settings.retention_max_messages,
        )?;
        if settings.auth_token.is_some() {
            debug!("Auth token configured for {}", settings.service_url);
        }
        info!(
            "Opened log broker {} (data dir {})",
            settings.service_url, settings.data_dir
        );
        Ok(Self::with_store(&settings.service_url, store))
    }

    /// A broker whose storage is removed when it is dropped.
    pub fn temporary(retention_max_messages: Option<usize>) -> Result<Self, BrokerError> {
        let store = Persistence::temporary(None, retention_max_messages)?;
        Ok(Self::with_store("embedded://temporary", store))
    }

    pub fn with_store(service_url: &str, store: Persistence) -> Self {
        Self {
            service_url: service_url.to_string(),
            store,
            topics: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Drops the connection. Blocked receives and reads return `Unavailable`.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Log broker {} disconnected", self.service_url);
            for topic in self.lock().values() {
                topic.notify.notify_waiters();
            }
        }
    }

    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Log broker {} reconnected", self.service_url);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable(self.service_url.clone()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live state of `name`, loading its delayed index on first use.
    fn topic_entry<'a>(
        &self,
        topics: &'a mut HashMap<String, Topic>,
        name: &str,
    ) -> Result<&'a mut Topic, BrokerError> {
        if !topics.contains_key(name) {
            let mut topic = Topic::new(name);
            let now = now_ms();
            for (seq, at) in self.store.delayed(name)? {
                if at > now {
                    topic.delayed.insert(seq, at);
                }
            }
            debug!("Loaded topic '{}'", name);
            topics.insert(name.to_string(), topic);
        }
        topics
            .get_mut(name)
            .ok_or_else(|| BrokerError::Storage(format!("topic '{name}' vanished")))
    }

    fn notify_handle(&self, topic: &str) -> Result<Arc<Notify>, BrokerError> {
        let mut topics = self.lock();
        Ok(self.topic_entry(&mut topics, topic)?.notify.clone())
    }

    fn to_message(topic: &str, seq: u64, stored: StoredMessage, redeliveries: u32) -> Message {
        Message::new(
            MessageId(seq),
            topic,
            stored.payload,
            stored.key,
            stored.properties,
            stored.publish_time,
            stored.deliver_at,
            stored.compression,
            redeliveries,
        )
    }

    fn dispatch(&self, key: &ConsumerKey, now: i64) -> Result<Dispatch, BrokerError> {
        let mut topics = self.lock();
        let topic = self.topic_entry(&mut topics, &key.topic)?;
        let next_visible = topic.next_visible_at(now);
        let Topic {
            subscriptions,
            delayed,
            ..
        } = topic;
        let sub = subscriptions
            .get_mut(&key.subscription)
            .filter(|sub| sub.consumers.contains(&key.consumer))
            .ok_or_else(|| BrokerError::UnknownConsumer {
                subscription: key.subscription.clone(),
                consumer: key.consumer.clone(),
            })?;

        loop {
            let picked = match sub.take_expired(&key.consumer, now) {
                Some(expired) => Some(expired),
                None => {
                    let mut found = None;
                    for seq in self.store.ids_from(&key.topic, sub.mark_delete + 1)? {
                        let seq = seq?;
                        if sub.is_available(seq) && is_visible(delayed, seq, now) {
                            found = Some((seq, sub.assign(seq, &key.consumer, now)));
                            break;
                        }
                    }
                    found
                }
            };

            let Some((seq, redeliveries)) = picked else {
                let wake = match (sub.next_redelivery(), next_visible) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                return Ok(Dispatch::Idle(wake));
            };

            match self.store.get(&key.topic, seq)? {
                Some(stored) => {
                    if redeliveries > 0 {
                        debug!(
                            "Redelivering {}/{} to {} (attempt {})",
                            key.topic,
                            seq,
                            key.consumer,
                            redeliveries + 1
                        );
                    }
                    return Ok(Dispatch::Ready(Self::to_message(
                        &key.topic,
                        seq,
                        stored,
                        redeliveries,
                    )));
                }
                // trimmed by retention after it was handed out
                None => sub.forget(seq),
            }
        }
    }

    /// First visible message after `after`, or when to look again.
    fn next_readable(&self, topic: &str, after: u64, now: i64) -> Result<Dispatch, BrokerError> {
        match self.store.next_from(topic, after + 1)? {
            Some((seq, stored)) => match stored.deliver_at {
                Some(at) if at > now => Ok(Dispatch::Idle(Some(at))),
                _ => Ok(Dispatch::Ready(Self::to_message(topic, seq, stored, 0))),
            },
            None => Ok(Dispatch::Idle(None)),
        }
    }

    fn check_retained(&self, topic: &str, requested: MessageId) -> Result<(), BrokerError> {
        let expired = match self.store.first_id(topic)? {
            Some(first) => requested.0 + 1 < first,
            None => self.store.last_id(topic)? > requested.0,
        };
        if expired {
            return Err(BrokerError::PositionExpired {
                requested,
                earliest_available: self.store.first_id(topic)?.map(MessageId),
            });
        }
        Ok(())
    }
}

/// Waits for a change signal, the wake-up time, or the deadline, whichever
/// comes first. Returns `false` once the deadline has passed.
async fn wait_for_change(
    notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
    deadline: Instant,
    wake_at: Option<i64>,
) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    let mut until = deadline;
    if let Some(at) = wake_at {
        let delta = u64::try_from(at.saturating_sub(now_ms())).unwrap_or(0);
        if let Some(wake) = now.checked_add(Duration::from_millis(delta)) {
            until = until.min(wake);
        }
    }
    tokio::select! {
        _ = notified => {}
        _ = tokio::time::sleep_until(until) => {}
    }
    true
}

#[async_trait]
impl LogBroker for EmbeddedLogBroker {
    fn service_url(&self) -> &str {
        &self.service_url
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut topics = self.lock();
        self.topic_entry(&mut topics, topic)?;
        Ok(())
    }

    async fn publish_batch(
        &self,
        topic: &str,
        batch: Vec<OutboundMessage>,
    ) -> Result<Vec<Result<MessageId, BrokerError>>, BrokerError> {
        self.check_connected()?;
        let now = now_ms();
        let mut topics = self.lock();
        let state = self.topic_entry(&mut topics, topic)?;

        let mut results = Vec::with_capacity(batch.len());
        for mut msg in batch {
            msg.stamp(now);
            let deliver_at = msg.deliver_at();
            let stored = StoredMessage {
                payload: msg.payload,
                key: msg.key,
                properties: msg.properties,
                publish_time: now,
                deliver_at,
                compression: msg.compression,
            };
            match self.store.append(topic, &stored) {
                Ok(id) => {
                    if let Some(at) = deliver_at.filter(|at| *at > now) {
                        state.delayed.insert(id.0, at);
                    }
                    results.push(Ok(id));
                }
                Err(e) => results.push(Err(e)),
            }
        }

        let trimmed = self.store.enforce_retention(topic)?;
        if trimmed > 0 {
            debug!("Retention trimmed {} messages from '{}'", trimmed, topic);
            if let Some(first) = self.store.first_id(topic)? {
                state.delayed.retain(|seq, _| *seq >= first);
                for sub in state.subscriptions.values_mut() {
                    if sub.skip_trimmed(first) {
                        self.store.save_cursor(topic, &sub.name, &sub.cursor())?;
                    }
                }
            }
        }

        state.notify.notify_waiters();
        Ok(results)
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        ack_timeout: Duration,
    ) -> Result<ConsumerKey, BrokerError> {
        self.check_connected()?;
        let mut topics = self.lock();
        let state = self.topic_entry(&mut topics, topic)?;

        if !state.subscriptions.contains_key(subscription) {
            let sub = match self.store.load_cursor(topic, subscription)? {
                Some(cursor) => Subscription::from_cursor(subscription, cursor, ack_timeout),
                None => Subscription::new(subscription, mode, ack_timeout),
            };
            state.subscriptions.insert(subscription.to_string(), sub);
        }
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::Storage(format!("subscription '{subscription}' vanished")))?;

        let consumer = Uuid::new_v4().to_string();
        sub.attach(consumer.clone(), mode, ack_timeout)?;
        self.store.save_cursor(topic, subscription, &sub.cursor())?;

        info!(
            "Consumer {} attached to {}/{} ({:?})",
            consumer, topic, subscription, mode
        );
        Ok(ConsumerKey {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            consumer,
        })
    }

    async fn unsubscribe(&self, key: &ConsumerKey) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut topics = self.lock();
        let state = self.topic_entry(&mut topics, &key.topic)?;
        if let Some(sub) = state.subscriptions.get_mut(&key.subscription) {
            let released = sub.detach(&key.consumer);
            if released > 0 {
                debug!(
                    "Released {} unacknowledged messages from {}",
                    released, key.consumer
                );
                state.notify.notify_waiters();
            }
        }
        info!(
            "Consumer {} detached from {}/{}",
            key.consumer, key.topic, key.subscription
        );
        Ok(())
    }

    async fn receive(
        &self,
        key: &ConsumerKey,
        wait: Duration,
    ) -> Result<Option<Message>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            self.check_connected()?;
            let notify = self.notify_handle(&key.topic)?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.dispatch(key, now_ms())? {
                Dispatch::Ready(msg) => return Ok(Some(msg)),
                Dispatch::Idle(wake_at) => wake_at,
            };
            if !wait_for_change(notified, deadline, wake_at).await {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&self, key: &ConsumerKey, id: MessageId) -> Result<(), BrokerError> {
        self.check_connected()?;
        let last = self.store.last_id(&key.topic)?;
        if id.0 == 0 || id.0 > last {
            return Err(BrokerError::Rejected(format!(
                "message {} does not exist on '{}'",
                id, key.topic
            )));
        }

        let mut topics = self.lock();
        let state = self.topic_entry(&mut topics, &key.topic)?;
        let sub = state
            .subscriptions
            .get_mut(&key.subscription)
            .filter(|sub| sub.consumers.contains(&key.consumer))
            .ok_or_else(|| BrokerError::UnknownConsumer {
                subscription: key.subscription.clone(),
                consumer: key.consumer.clone(),
            })?;
        if sub.acknowledge(id.0) {
            self.store
                .save_cursor(&key.topic, &key.subscription, &sub.cursor())?;
        }
        Ok(())
    }

    async fn resolve_position(
        &self,
        topic: &str,
        position: ReadPosition,
    ) -> Result<ReadPosition, BrokerError> {
        self.check_connected()?;
        match position {
            ReadPosition::Latest => Ok(ReadPosition::Message(MessageId(
                self.store.last_id(topic)?,
            ))),
            other => Ok(other),
        }
    }

    async fn read(
        &self,
        topic: &str,
        position: ReadPosition,
        wait: Duration,
    ) -> Result<Option<Message>, BrokerError> {
        self.check_connected()?;
        let after = match position {
            ReadPosition::Earliest => 0,
            ReadPosition::Latest => self.store.last_id(topic)?,
            ReadPosition::Message(id) => {
                self.check_retained(topic, id)?;
                id.0
            }
        };

        let deadline = Instant::now() + wait;
        loop {
            self.check_connected()?;
            let notify = self.notify_handle(topic)?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.next_readable(topic, after, now_ms())? {
                Dispatch::Ready(msg) => return Ok(Some(msg)),
                Dispatch::Idle(wake_at) => wake_at,
            };
            if !wait_for_change(notified, deadline, wake_at).await {
                return Ok(None);
            }
        }
    }

    async fn topic_stats(&self, topic: &str) -> Result<TopicStats, BrokerError> {
        self.check_connected()?;
        let first = self.store.first_id(topic)?;
        let last = self.store.last_id(topic)?;
        let retained = self.store.len(topic)?;

        let mut topics = self.lock();
        let state = self.topic_entry(&mut topics, topic)?;
        let now = now_ms();
        state.next_visible_at(now);

        let mut subscriptions: Vec<SubscriptionStats> = state
            .subscriptions
            .values()
            .map(|sub| SubscriptionStats {
                name: sub.name.clone(),
                mode: sub.mode,
                consumers: sub.consumers.len(),
                backlog: sub.backlog(first, last),
                unacked: sub.pending.len(),
            })
            .collect();
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(TopicStats {
            topic: topic.to_string(),
            retained_messages: retained,
            earliest_message_id: first.map(MessageId),
            last_message_id: (last > 0).then_some(MessageId(last)),
            delayed_messages: state.delayed.len(),
            subscriptions,
        })
    }
}

impl std::fmt::Debug for EmbeddedLogBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedLogBroker")
            .field("service_url", &self.service_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}
