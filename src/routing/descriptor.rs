use serde::Deserialize;

use crate::broker::SubscriptionMode;

/// Where a route takes its messages from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// A named subscription on a log topic.
    Subscription {
        topic: String,
        subscription: String,
        #[serde(default)]
        mode: SubscriptionMode,
        /// Falls back to the consumer default when absent.
        #[serde(default)]
        ack_timeout_secs: Option<u64>,
    },
    /// A queue on the queue broker.
    Queue { queue: String },
    /// Requests submitted through the ingress under `endpoint`.
    Inbound { endpoint: String },
}

/// Where a route delivers to. Dead-letter paths use the same descriptors.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkDescriptor {
    Topic {
        topic: String,
    },
    Queue {
        queue: String,
    },
    #[default]
    Log,
}
