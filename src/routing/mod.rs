//! The `routing` module moves messages between the two brokers, or from an
//! inbound endpoint to a broker.
//!
//! A [`Route`] decodes each message, runs its [`Transform`], re-encodes it and
//! hands it to a [`Sink`]. Transient sink failures are retried with bounded
//! exponential backoff; when the attempts run out, or the message cannot be
//! decoded at all, the original message and the failure details go to the
//! route's dead-letter sink and the route carries on with the next message.
//!
//! The [`RoutingPipeline`] builds the configured routes at startup and runs
//! each on its own task. A route whose endpoints cannot be built is
//! `Suspended` and left out.

pub mod descriptor;
pub mod pipeline;
pub mod policy;
pub mod route;
pub mod sink;
pub mod source;
pub mod transform;

pub use descriptor::{SinkDescriptor, SourceDescriptor};
pub use pipeline::{RouteState, RouteStats, RoutingContext, RoutingPipeline};
pub use policy::RetryPolicy;
pub use route::{
    DEAD_LETTER_ATTEMPTS, DEAD_LETTER_ERROR, DEAD_LETTER_REASON, DEAD_LETTER_ROUTE,
    DeadLetterReason, Envelope, ProcessOutcome, Route, RouteCounters,
};
pub use sink::{LogSink, QueueSink, Sink, TopicSink};
pub use source::{
    InboundHandle, InboundSource, MessageSource, QueueSource, RouteResult, Settlement,
    SourceItem, SubscriptionSource,
};
pub use transform::{Body, LogTransform, MessageFormat, Passthrough, Transform, transform_fn};

#[cfg(test)]
mod tests;
