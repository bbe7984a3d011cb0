use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::broker::{CompressionHint, MessageId, Properties, SubscriptionMode};
use crate::utils::error::BrokerError;

const META_TREE: &str = "__meta";
const CURSOR_TREE: &str = "__cursors";
const TOPIC_PREFIX: &str = "topic/";

/// A message as written to a topic tree, keyed by its big-endian sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub properties: Properties,
    /// Milliseconds since the epoch.
    pub publish_time: i64,
    pub deliver_at: Option<i64>,
    pub compression: Option<CompressionHint>,
}

/// Durable part of a subscription: everything up to `mark_delete` is
/// acknowledged, plus the individually acknowledged ids above it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StoredCursor {
    pub mode: SubscriptionMode,
    pub mark_delete: u64,
    pub acked: BTreeSet<u64>,
}

/// Sled-backed topic logs with per-topic retention.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
    ttl_seconds: Option<i64>,
    max_messages_per_topic: Option<usize>,
}

impl Persistence {
    pub fn open(
        path: impl AsRef<Path>,
        ttl_seconds: Option<i64>,
        max_messages_per_topic: Option<usize>,
    ) -> Result<Self, BrokerError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_messages_per_topic,
        })
    }

    /// A store that lives only as long as this value.
    pub fn temporary(
        ttl_seconds: Option<i64>,
        max_messages_per_topic: Option<usize>,
    ) -> Result<Self, BrokerError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            ttl_seconds,
            max_messages_per_topic,
        })
    }

    fn topic_tree(&self, topic: &str) -> Result<Tree, BrokerError> {
        Ok(self.db.open_tree(format!("{TOPIC_PREFIX}{topic}"))?)
    }

    /// Names of every topic that has ever been written to.
    pub fn topics(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|name| {
                let name = String::from_utf8(name.to_vec()).ok()?;
                name.strip_prefix(TOPIC_PREFIX).map(str::to_string)
            })
            .collect()
    }

    /// Appends a message and returns its sequence. Sequences never repeat,
    /// even after the message is trimmed.
    pub fn append(&self, topic: &str, msg: &StoredMessage) -> Result<MessageId, BrokerError> {
        let seq = self.last_id(topic)? + 1;
        let serialized = serde_json::to_vec(msg)?;
        self.topic_tree(topic)?
            .insert(seq.to_be_bytes(), serialized)?;
        self.db
            .open_tree(META_TREE)?
            .insert(topic.as_bytes(), &seq.to_be_bytes())?;
        Ok(MessageId(seq))
    }

    pub fn get(&self, topic: &str, id: u64) -> Result<Option<StoredMessage>, BrokerError> {
        match self.topic_tree(topic)?.get(id.to_be_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// The first retained message with sequence `>= start`.
    pub fn next_from(
        &self,
        topic: &str,
        start: u64,
    ) -> Result<Option<(u64, StoredMessage)>, BrokerError> {
        match self.topic_tree(topic)?.range(start.to_be_bytes()..).next() {
            Some(entry) => {
                let (key, raw) = entry?;
                Ok(Some((decode_key(&key)?, serde_json::from_slice(&raw)?)))
            }
            None => Ok(None),
        }
    }

    /// Retained sequences `>= start`, in order, read lazily.
    pub fn ids_from(
        &self,
        topic: &str,
        start: u64,
    ) -> Result<impl Iterator<Item = Result<u64, BrokerError>> + use<>, BrokerError> {
        Ok(self
            .topic_tree(topic)?
            .range(start.to_be_bytes()..)
            .keys()
            .map(|key| decode_key(&key?)))
    }

    /// Every retained message with a visibility time, as `(seq, deliver_at)`.
    pub fn delayed(&self, topic: &str) -> Result<Vec<(u64, i64)>, BrokerError> {
        let mut out = Vec::new();
        for entry in self.topic_tree(topic)?.iter() {
            let (key, raw) = entry?;
            let msg: StoredMessage = serde_json::from_slice(&raw)?;
            if let Some(at) = msg.deliver_at {
                out.push((decode_key(&key)?, at));
            }
        }
        Ok(out)
    }

    pub fn first_id(&self, topic: &str) -> Result<Option<u64>, BrokerError> {
        match self.topic_tree(topic)?.first()? {
            Some((key, _)) => Ok(Some(decode_key(&key)?)),
            None => Ok(None),
        }
    }

    /// Last sequence ever assigned on `topic`, 0 if none.
    pub fn last_id(&self, topic: &str) -> Result<u64, BrokerError> {
        match self.db.open_tree(META_TREE)?.get(topic.as_bytes())? {
            Some(raw) => decode_key(&raw),
            None => Ok(0),
        }
    }

    pub fn len(&self, topic: &str) -> Result<usize, BrokerError> {
        Ok(self.topic_tree(topic)?.len())
    }

    /// Drops messages older than the TTL, then the oldest beyond the count
    /// limit. Returns how many were removed.
    pub fn enforce_retention(&self, topic: &str) -> Result<usize, BrokerError> {
        let tree = self.topic_tree(topic)?;
        let mut removed = 0;

        if let Some(ttl) = self.ttl_seconds {
            let expiry = Utc::now()
                .timestamp_millis()
                .saturating_sub(ttl.saturating_mul(1000));
            while let Some((key, raw)) = tree.first()? {
                let msg: StoredMessage = serde_json::from_slice(&raw)?;
                if msg.publish_time >= expiry {
                    break;
                }
                tree.remove(key)?;
                removed += 1;
            }
        }

        if let Some(max) = self.max_messages_per_topic {
            while tree.len() > max {
                if tree.pop_min()?.is_none() {
                    break;
                }
                removed += 1;
            }
        }

        Ok(removed)
    }

    pub fn save_cursor(
        &self,
        topic: &str,
        subscription: &str,
        cursor: &StoredCursor,
    ) -> Result<(), BrokerError> {
        let serialized = serde_json::to_vec(cursor)?;
        self.db
            .open_tree(CURSOR_TREE)?
            .insert(cursor_key(topic, subscription), serialized)?;
        Ok(())
    }

    pub fn load_cursor(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Option<StoredCursor>, BrokerError> {
        match self
            .db
            .open_tree(CURSOR_TREE)?
            .get(cursor_key(topic, subscription))?
        {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush()?;
        Ok(())
    }
}

fn cursor_key(topic: &str, subscription: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(topic.len() + subscription.len() + 1);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key.extend_from_slice(subscription.as_bytes());
    key
}

fn decode_key(raw: &[u8]) -> Result<u64, BrokerError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| BrokerError::Storage(format!("bad sequence key of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_messages_per_topic", &self.max_messages_per_topic)
            .finish()
    }
}
