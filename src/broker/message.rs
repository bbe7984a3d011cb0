//! Message definitions shared by both broker sides.
//!
//! - `OutboundMessage` is what a producer hands to the broker: payload, key,
//!   properties, an optional delivery delay and a compression hint.
//! - `Message` is what consumers and readers observe: the same data plus the
//!   broker-assigned `MessageId`. It is immutable once built.
//! - `ReadPosition` is the cursor value used by positional readers.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::SendError;

/// String properties attached to a message. Order is irrelevant.
pub type Properties = HashMap<String, String>;

/// Broker-assigned identifier, monotonic within a topic. Sequence numbers
/// start at 1; `MessageId(0)` never names a real message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `now_ms + delay` in epoch milliseconds, saturating at `i64::MAX` so an
/// oversized delay means "never" rather than wrapping into the past.
pub(crate) fn millis_after(now_ms: i64, delay: Duration) -> i64 {
    i64::try_from(delay.as_millis())
        .ok()
        .and_then(|delay| now_ms.checked_add(delay))
        .unwrap_or(i64::MAX)
}

/// Opaque hint forwarded to the broker; the payload is never compressed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionHint {
    Lz4,
    Zlib,
    Zstd,
    Snappy,
}

impl fmt::Display for CompressionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lz4 => "lz4",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
        };
        f.write_str(name)
    }
}

/// Subscription access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// One active consumer, strict order.
    #[default]
    Exclusive,
    /// Many consumers, no cross-consumer ordering.
    Shared,
}

/// Where a positional reader starts, or where it currently is.
///
/// `Message(id)` means "positioned after `id`": the next read returns the
/// first message with a greater id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPosition {
    #[default]
    Earliest,
    Latest,
    Message(MessageId),
}

/// A message as handed to a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub(crate) payload: Vec<u8>,
    pub(crate) key: Option<String>,
    pub(crate) properties: Properties,
    pub(crate) deliver_after: Option<Duration>,
    pub(crate) deliver_at: Option<i64>,
    pub(crate) compression: Option<CompressionHint>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            properties: Properties::new(),
            deliver_after: None,
            deliver_at: None,
            compression: None,
        }
    }

    /// Serializes `value` as the JSON payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, SendError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.properties
            .extend(properties.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Withhold visibility to consumers and readers until `delay` after send.
    pub fn deliver_after(mut self, delay: Duration) -> Self {
        self.deliver_after = Some(delay);
        self
    }

    pub fn compression(mut self, hint: CompressionHint) -> Self {
        self.compression = Some(hint);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Fixes the visibility time relative to the send time `now_ms`.
    /// Calling it again keeps the first stamp.
    pub(crate) fn stamp(&mut self, now_ms: i64) {
        if self.deliver_at.is_none() {
            self.deliver_at = self
                .deliver_after
                .map(|delay| millis_after(now_ms, delay));
        }
    }

    pub(crate) fn deliver_at(&self) -> Option<i64> {
        self.deliver_at
    }
}

/// A message as observed by consumers and readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    topic: String,
    payload: Vec<u8>,
    key: Option<String>,
    properties: Properties,
    publish_time: i64,
    deliver_at: Option<i64>,
    compression: Option<CompressionHint>,
    redelivery_count: u32,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: MessageId,
        topic: &str,
        payload: Vec<u8>,
        key: Option<String>,
        properties: Properties,
        publish_time: i64,
        deliver_at: Option<i64>,
        compression: Option<CompressionHint>,
        redelivery_count: u32,
    ) -> Self {
        Self {
            id,
            topic: topic.to_string(),
            payload,
            key,
            properties,
            publish_time,
            deliver_at,
            compression,
            redelivery_count,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Milliseconds since the UNIX epoch at which the broker accepted the message.
    pub fn publish_time(&self) -> i64 {
        self.publish_time
    }

    pub fn deliver_at(&self) -> Option<i64> {
        self.deliver_at
    }

    pub fn compression(&self) -> Option<CompressionHint> {
        self.compression
    }

    /// How many times this message was handed out before this delivery.
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }
}
