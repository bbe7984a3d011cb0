//! Broker seam: the message model, the `LogBroker` and `QueueBroker`
//! interfaces, and the embedded implementations used by the server and tests.

pub mod api;
pub mod engine;
pub mod message;
pub mod queue;
pub mod topic;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{
    ConsumerKey, Delivery, LogBroker, QueueBroker, QueueMessage, QueueStats, SubscriptionStats,
    TopicStats,
};
pub use engine::EmbeddedLogBroker;
pub use message::{
    CompressionHint, Message, MessageId, OutboundMessage, Properties, ReadPosition,
    SubscriptionMode,
};
pub use queue::InMemoryQueueBroker;
