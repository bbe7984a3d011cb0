use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::broker::message::{SubscriptionMode, millis_after};
use crate::persistence::StoredCursor;
use crate::utils::error::BrokerError;

pub type ConsumerId = String;

/// A message handed to a consumer and not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelivery {
    pub consumer: ConsumerId,
    /// `None` when the subscription has no ack timeout.
    pub redeliver_at: Option<i64>,
}

/// Live state of one topic: its subscriptions, the visibility times of
/// delayed messages, and the signal raised whenever something changes.
#[derive(Debug)]
pub struct Topic {
    pub name: String,
    pub subscriptions: HashMap<String, Subscription>,
    pub delayed: BTreeMap<u64, i64>,
    pub notify: Arc<Notify>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: HashMap::new(),
            delayed: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Earliest future visibility time, dropping entries already visible.
    pub fn next_visible_at(&mut self, now: i64) -> Option<i64> {
        self.delayed.retain(|_, at| *at > now);
        self.delayed.values().min().copied()
    }
}

pub fn is_visible(delayed: &BTreeMap<u64, i64>, seq: u64, now: i64) -> bool {
    delayed.get(&seq).is_none_or(|at| *at <= now)
}

/// Acknowledgement state of one named subscription.
///
/// Everything `<= mark_delete` is acknowledged; `acked` holds the
/// individually acknowledged sequences above it.
#[derive(Debug)]
pub struct Subscription {
    pub name: String,
    pub mode: SubscriptionMode,
    pub ack_timeout: Duration,
    pub consumers: HashSet<ConsumerId>,
    pub mark_delete: u64,
    pub acked: BTreeSet<u64>,
    pub pending: BTreeMap<u64, PendingDelivery>,
    deliveries: HashMap<u64, u32>,
}

impl Subscription {
    pub fn new(name: &str, mode: SubscriptionMode, ack_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            mode,
            ack_timeout,
            consumers: HashSet::new(),
            mark_delete: 0,
            acked: BTreeSet::new(),
            pending: BTreeMap::new(),
            deliveries: HashMap::new(),
        }
    }

    pub fn from_cursor(name: &str, cursor: StoredCursor, ack_timeout: Duration) -> Self {
        let mut sub = Self::new(name, cursor.mode, ack_timeout);
        sub.mark_delete = cursor.mark_delete;
        sub.acked = cursor.acked;
        sub
    }

    pub fn cursor(&self) -> StoredCursor {
        StoredCursor {
            mode: self.mode,
            mark_delete: self.mark_delete,
            acked: self.acked.clone(),
        }
    }

    /// Adds a consumer. Exclusive subscriptions accept one at a time, and the
    /// mode can only change while nobody is attached.
    pub fn attach(
        &mut self,
        consumer: ConsumerId,
        mode: SubscriptionMode,
        ack_timeout: Duration,
    ) -> Result<(), BrokerError> {
        if !self.consumers.is_empty() {
            if mode != self.mode {
                return Err(BrokerError::Rejected(format!(
                    "subscription '{}' is {:?} and has active consumers",
                    self.name, self.mode
                )));
            }
            if self.mode == SubscriptionMode::Exclusive {
                return Err(BrokerError::ConsumerBusy(self.name.clone()));
            }
        }
        self.mode = mode;
        self.ack_timeout = ack_timeout;
        self.consumers.insert(consumer);
        Ok(())
    }

    /// Removes a consumer and releases its pending messages. Returns how many
    /// were released.
    pub fn detach(&mut self, consumer: &str) -> usize {
        self.consumers.remove(consumer);
        let before = self.pending.len();
        self.pending.retain(|_, p| p.consumer != consumer);
        before - self.pending.len()
    }

    /// Not acknowledged and not held by any consumer.
    pub fn is_available(&self, seq: u64) -> bool {
        seq > self.mark_delete && !self.acked.contains(&seq) && !self.pending.contains_key(&seq)
    }

    /// Re-assigns the oldest delivery whose ack timeout has passed.
    pub fn take_expired(&mut self, consumer: &str, now: i64) -> Option<(u64, u32)> {
        let seq = self
            .pending
            .iter()
            .find(|(_, p)| p.redeliver_at.is_some_and(|at| at <= now))
            .map(|(seq, _)| *seq)?;
        Some((seq, self.assign(seq, consumer, now)))
    }

    /// Hands `seq` to `consumer`; returns how many times it was delivered before.
    pub fn assign(&mut self, seq: u64, consumer: &str, now: i64) -> u32 {
        let redeliver_at = if self.ack_timeout.is_zero() {
            None
        } else {
            Some(millis_after(now, self.ack_timeout))
        };
        self.pending.insert(
            seq,
            PendingDelivery {
                consumer: consumer.to_string(),
                redeliver_at,
            },
        );
        let count = self.deliveries.entry(seq).or_insert(0);
        *count += 1;
        *count - 1
    }

    /// Returns `true` if the acknowledgement changed the durable state.
    pub fn acknowledge(&mut self, seq: u64) -> bool {
        self.pending.remove(&seq);
        self.deliveries.remove(&seq);
        if seq <= self.mark_delete || !self.acked.insert(seq) {
            return false;
        }
        self.advance();
        true
    }

    /// Treats everything before `first_retained` as gone.
    pub fn skip_trimmed(&mut self, first_retained: u64) -> bool {
        let floor = first_retained.saturating_sub(1);
        if self.mark_delete >= floor {
            return false;
        }
        self.mark_delete = floor;
        self.acked.retain(|seq| *seq > floor);
        self.pending.retain(|seq, _| *seq > floor);
        self.deliveries.retain(|seq, _| *seq > floor);
        self.advance();
        true
    }

    /// Drops a pending delivery whose message no longer exists.
    pub fn forget(&mut self, seq: u64) {
        self.pending.remove(&seq);
        self.deliveries.remove(&seq);
    }

    pub fn next_redelivery(&self) -> Option<i64> {
        self.pending.values().filter_map(|p| p.redeliver_at).min()
    }

    /// Retained messages not yet acknowledged.
    pub fn backlog(&self, first_retained: Option<u64>, last: u64) -> u64 {
        let Some(first) = first_retained else {
            return 0;
        };
        let floor = self.mark_delete.max(first.saturating_sub(1));
        if last <= floor {
            return 0;
        }
        let acked_above = self.acked.range(floor + 1..).count() as u64;
        (last - floor).saturating_sub(acked_above)
    }

    fn advance(&mut self) {
        while self.acked.remove(&(self.mark_delete + 1)) {
            self.mark_delete += 1;
        }
    }
}
