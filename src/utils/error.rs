//! The `error` module defines the error types used within `relaymq`.
//!
//! Every component returns its own error enum so callers can match on the
//! failures that matter at that boundary. Errors crossing a component boundary
//! are always returned as values, never panics.

use std::time::Duration;

use thiserror::Error;

use crate::broker::MessageId;

/// Errors reported by a broker implementation (log side or queue side).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// The broker connection is down or could not be established.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the request.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// The request did not complete within its deadline.
    #[error("broker operation timed out: {0}")]
    Timeout(String),

    /// The named subscription has no consumer with the given id.
    #[error("unknown consumer '{consumer}' on subscription '{subscription}'")]
    UnknownConsumer {
        subscription: String,
        consumer: String,
    },

    /// An exclusive subscription already has an active consumer.
    #[error("subscription '{0}' is exclusive and already has an active consumer")]
    ConsumerBusy(String),

    /// A reader was positioned inside a range that retention has discarded.
    #[error("position after {requested} is no longer retained (earliest available: {earliest_available:?})")]
    PositionExpired {
        requested: MessageId,
        earliest_available: Option<MessageId>,
    },

    /// The queue does not exist.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// Local storage failure inside an embedded broker.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    /// Connection-level failures that may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<sled::Error> for BrokerError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt record: {err}"))
    }
}

/// Failures of a single producer send.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("send rejected: {0}")]
    SendRejected(String),

    #[error("payload could not be serialized: {0}")]
    Serialization(String),

    #[error("producer '{0}' is closed")]
    ProducerClosed(String),

    /// The producer was closed before the message reached the broker.
    #[error("send abandoned during shutdown")]
    Abandoned,
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }
}

impl From<BrokerError> for SendError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) | BrokerError::Timeout(msg) => {
                Self::BrokerUnavailable(msg)
            }
            other => Self::SendRejected(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SendError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failures while opening or closing endpoints.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EndpointError {
    #[error("endpoint for topic '{topic}' unavailable: {source}")]
    EndpointUnavailable { topic: String, source: BrokerError },

    #[error("endpoint for topic '{topic}' rejected: {source}")]
    Rejected { topic: String, source: BrokerError },

    #[error("endpoint manager is shut down")]
    ShutDown,
}

impl EndpointError {
    pub(crate) fn from_broker(topic: &str, source: BrokerError) -> Self {
        if source.is_retryable() {
            Self::EndpointUnavailable {
                topic: topic.to_string(),
                source,
            }
        } else {
            Self::Rejected {
                topic: topic.to_string(),
                source,
            }
        }
    }

    /// Mid-run, an unavailable endpoint may be opened again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EndpointUnavailable { .. })
    }
}

/// Raised by a consumer handler; leaves the message unacknowledged.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures of the positional reader.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("reader position after {requested} expired (earliest available: {earliest_available:?})")]
    PositionExpired {
        requested: MessageId,
        earliest_available: Option<MessageId>,
    },

    #[error("reader is closed")]
    Closed,

    #[error(transparent)]
    Broker(BrokerError),
}

impl From<BrokerError> for ReadError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::PositionExpired {
                requested,
                earliest_available,
            } => Self::PositionExpired {
                requested,
                earliest_available,
            },
            other => Self::Broker(other),
        }
    }
}

/// Route-level failures. Only `SinkDelivery` with `transient = true` is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transform failed: {0}")]
    TransformFailure(String),

    #[error("sink delivery failed: {message}")]
    SinkDelivery { message: String, transient: bool },

    #[error("dead-letter delivery failed: {0}")]
    DeadLetterFailed(String),

    #[error("route setup failed: {0}")]
    Setup(String),

    /// The route was stopped while waiting to retry; the message stays with
    /// its source.
    #[error("stopped during retry backoff after {0} attempts")]
    Interrupted(u32),
}

impl RouteError {
    pub fn sink(message: impl Into<String>, transient: bool) -> Self {
        Self::SinkDelivery {
            message: message.into(),
            transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SinkDelivery { transient: true, .. })
    }
}

impl From<SendError> for RouteError {
    fn from(err: SendError) -> Self {
        let transient = err.is_retryable();
        Self::sink(err.to_string(), transient)
    }
}

impl From<BrokerError> for RouteError {
    fn from(err: BrokerError) -> Self {
        let transient = err.is_retryable();
        Self::sink(err.to_string(), transient)
    }
}

/// Failures of a stats query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("admin surface unreachable: {0}")]
    AdminUnavailable(String),

    #[error("stats query failed: {0}")]
    Query(String),
}

impl From<BrokerError> for StatsError {
    fn from(err: BrokerError) -> Self {
        if err.is_retryable() {
            Self::AdminUnavailable(err.to_string())
        } else {
            Self::Query(err.to_string())
        }
    }
}

/// Process-level errors surfaced by startup and shutdown.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown exceeded drain timeout of {0:?}")]
    DrainTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
