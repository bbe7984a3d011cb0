use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::broker::{CompressionHint, MessageId};
use crate::stats::Snapshot;

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// One message for the events topic; answered once the broker accepted it.
    #[serde(rename = "submit")]
    Submit {
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default)]
        properties: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compression: Option<CompressionHint>,
    },
    /// Many messages for the batch topic; answered once they are buffered.
    #[serde(rename = "submit_batch")]
    SubmitBatch { payloads: Vec<String> },
    /// A request for the route bound to `endpoint`.
    #[serde(rename = "inbound")]
    Inbound {
        endpoint: String,
        payload: String,
        #[serde(default)]
        properties: HashMap<String, String>,
    },
    #[serde(rename = "stats")]
    Stats { topic: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "accepted")]
    Accepted { message_id: MessageId },
    #[serde(rename = "batch_accepted")]
    BatchAccepted { count: usize },
    #[serde(rename = "routed")]
    Routed { outcome: String, attempts: u32 },
    #[serde(rename = "stats")]
    Stats(Snapshot),
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
