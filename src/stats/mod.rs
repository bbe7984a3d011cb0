//! The `stats` module answers point-in-time counter queries.
//!
//! Every query is a pure read. Topic and queue queries make a single call to
//! the broker; an unreachable broker yields a `StatsError` and nothing else.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::broker::{LogBroker, QueueBroker, QueueStats, TopicStats};
use crate::consumer::ConsumerStats;
use crate::endpoint::EndpointManager;
use crate::producer::ProducerStats;
use crate::routing::{RouteStats, RoutingPipeline};
use crate::utils::error::StatsError;

/// Everything at once, as served over the ingress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub topic: TopicStats,
    pub producers: Vec<ProducerStats>,
    pub consumers: Vec<ConsumerStats>,
    pub routes: Vec<RouteStats>,
}

#[derive(Debug, Clone)]
pub struct StatsCollector {
    log_broker: Arc<dyn LogBroker>,
    queue_broker: Option<Arc<dyn QueueBroker>>,
    endpoints: Arc<EndpointManager>,
    pipeline: Option<Arc<RoutingPipeline>>,
}

impl StatsCollector {
    pub fn new(endpoints: Arc<EndpointManager>) -> Self {
        Self {
            log_broker: endpoints.broker().clone(),
            queue_broker: None,
            endpoints,
            pipeline: None,
        }
    }

    pub fn with_queue_broker(mut self, broker: Arc<dyn QueueBroker>) -> Self {
        self.queue_broker = Some(broker);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<RoutingPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub async fn topic_stats(&self, topic: &str) -> Result<TopicStats, StatsError> {
        self.log_broker.topic_stats(topic).await.map_err(|e| {
            warn!("Stats for topic '{}' unavailable: {}", topic, e);
            StatsError::from(e)
        })
    }

    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, StatsError> {
        let broker = self
            .queue_broker
            .as_ref()
            .ok_or_else(|| StatsError::AdminUnavailable("no queue broker configured".into()))?;
        Ok(broker.queue_stats(queue).await?)
    }

    pub fn producer_stats(&self) -> Vec<ProducerStats> {
        self.endpoints
            .producers()
            .iter()
            .map(|p| p.stats())
            .collect()
    }

    pub fn consumer_stats(&self) -> Vec<ConsumerStats> {
        self.endpoints
            .consumers()
            .iter()
            .map(|c| c.stats())
            .collect()
    }

    pub fn route_stats(&self) -> Vec<RouteStats> {
        self.pipeline
            .as_ref()
            .map(|p| p.stats())
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, topic: &str) -> Result<Snapshot, StatsError> {
        Ok(Snapshot {
            topic: self.topic_stats(topic).await?,
            producers: self.producer_stats(),
            consumers: self.consumer_stats(),
            routes: self.route_stats(),
        })
    }
}
