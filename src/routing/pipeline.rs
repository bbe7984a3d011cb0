use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::broker::QueueBroker;
use crate::config::RouteSettings;
use crate::endpoint::{EndpointConfig, EndpointManager};
use crate::routing::descriptor::{SinkDescriptor, SourceDescriptor};
use crate::routing::route::{Route, RouteCounters};
use crate::routing::sink::{LogSink, QueueSink, Sink, TopicSink};
use crate::routing::source::{
    InboundHandle, InboundSource, MessageSource, QueueSource, SubscriptionSource,
};
use crate::routing::transform::LogTransform;
use crate::utils::error::RouteError;

/// Requests that may wait on one inbound endpoint.
const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RouteState {
    Active,
    /// Could not be built; excluded and never retried.
    Suspended { reason: String },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStats {
    pub route_id: String,
    pub state: RouteState,
    /// Absent for suspended routes.
    pub counters: Option<RouteCounters>,
}

/// What routes need to reach the outside world.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub endpoints: Arc<EndpointManager>,
    pub queue_broker: Arc<dyn QueueBroker>,
    pub endpoint_config: EndpointConfig,
    /// Used when a subscription source names no ack timeout.
    pub ack_timeout: Duration,
}

struct Running {
    route: Arc<Route>,
    source: Arc<dyn MessageSource>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    in_flight: Arc<AtomicBool>,
}

struct Entry {
    id: String,
    state: RouteState,
    running: Option<Running>,
}

/// The set of routes, each run by its own task.
pub struct RoutingPipeline {
    poll_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
    inbound: Mutex<HashMap<String, InboundHandle>>,
}

impl std::fmt::Debug for RoutingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingPipeline")
            .field("routes", &self.states())
            .finish()
    }
}

impl RoutingPipeline {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            poll_timeout,
            entries: Mutex::new(Vec::new()),
            inbound: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbound_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, InboundHandle>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds and starts every configured route. A route whose endpoints
    /// cannot be built is logged and left `Suspended`; the others still run.
    pub async fn start(routes: &[RouteSettings], ctx: &RoutingContext) -> Self {
        let pipeline = Self::new(ctx.endpoint_config.poll_timeout);
        for settings in routes {
            match pipeline.build(settings, ctx).await {
                Ok((route, source)) => pipeline.spawn(route, source),
                Err(e) => {
                    error!("Route {} suspended: {}", settings.id, e);
                    pipeline.suspend(&settings.id, e.to_string());
                }
            }
        }
        pipeline
    }

    async fn build(
        &self,
        settings: &RouteSettings,
        ctx: &RoutingContext,
    ) -> Result<(Route, Arc<dyn MessageSource>), RouteError> {
        let sink = build_sink(&settings.sink, &settings.id, ctx).await?;
        let dead_letter =
            build_sink(&settings.dead_letter, &format!("{}-dead-letter", settings.id), ctx).await?;

        let source: Arc<dyn MessageSource> = match &settings.source {
            SourceDescriptor::Subscription {
                topic,
                subscription,
                mode,
                ack_timeout_secs,
            } => {
                let ack_timeout = ack_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.ack_timeout);
                let consumer = ctx
                    .endpoints
                    .open_consumer(topic, subscription, *mode, ack_timeout, &ctx.endpoint_config)
                    .await
                    .map_err(|e| RouteError::Setup(e.to_string()))?;
                Arc::new(SubscriptionSource::new(consumer))
            }
            SourceDescriptor::Queue { queue } => {
                ctx.queue_broker
                    .declare_queue(queue)
                    .await
                    .map_err(|e| RouteError::Setup(e.to_string()))?;
                Arc::new(QueueSource::new(ctx.queue_broker.clone(), queue))
            }
            SourceDescriptor::Inbound { endpoint } => {
                if self.inbound_map().contains_key(endpoint) {
                    return Err(RouteError::Setup(format!(
                        "inbound endpoint '{endpoint}' is already bound"
                    )));
                }
                let (source, handle) = InboundSource::channel(endpoint, INBOUND_CAPACITY);
                self.inbound_map().insert(endpoint.clone(), handle);
                Arc::new(source)
            }
        };

        let route = Route::new(
            &settings.id,
            settings.format,
            Arc::new(LogTransform::new(&settings.id)),
            sink,
            dead_letter,
            settings.retry.policy(),
        );
        Ok((route, source))
    }

    /// Starts a task running `route` over `source`.
    pub fn spawn(&self, route: Route, source: Arc<dyn MessageSource>) {
        let route = Arc::new(route);
        let (stop_tx, stop_rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_route(
            route.clone(),
            source.clone(),
            self.poll_timeout,
            stop_rx,
            in_flight.clone(),
        ));
        info!("Route {} active: {}", route.id(), source.describe());

        self.entries().push(Entry {
            id: route.id().to_string(),
            state: RouteState::Active,
            running: Some(Running {
                route,
                source,
                stop_tx,
                task: Some(task),
                in_flight,
            }),
        });
    }

    /// Records a route that will not run.
    pub fn suspend(&self, id: &str, reason: impl Into<String>) {
        self.entries().push(Entry {
            id: id.to_string(),
            state: RouteState::Suspended {
                reason: reason.into(),
            },
            running: None,
        });
    }

    pub fn states(&self) -> Vec<(String, RouteState)> {
        self.entries()
            .iter()
            .map(|e| (e.id.clone(), e.state.clone()))
            .collect()
    }

    pub fn state(&self, id: &str) -> Option<RouteState> {
        self.entries()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.state.clone())
    }

    pub fn stats(&self) -> Vec<RouteStats> {
        self.entries()
            .iter()
            .map(|e| RouteStats {
                route_id: e.id.clone(),
                state: e.state.clone(),
                counters: e.running.as_ref().map(|r| r.route.counters()),
            })
            .collect()
    }

    /// Submission handle of an inbound endpoint, if a running route binds it.
    pub fn inbound(&self, endpoint: &str) -> Option<InboundHandle> {
        self.inbound_map().get(endpoint).cloned()
    }

    /// Stops every route at its next message boundary, or during a retry
    /// backoff, leaving that message with its source. Waits at most
    /// `drain_timeout` overall. Returns how many in-flight messages were
    /// abandoned.
    pub async fn stop(&self, drain_timeout: Duration) -> usize {
        let deadline = Instant::now() + drain_timeout;
        let mut stopping = Vec::new();
        for entry in self.entries().iter_mut() {
            if let Some(running) = &mut entry.running {
                running.stop_tx.send_replace(true);
                if let Some(task) = running.task.take() {
                    stopping.push((
                        entry.id.clone(),
                        task,
                        running.source.clone(),
                        running.in_flight.clone(),
                    ));
                }
            }
        }
        self.inbound_map().clear();

        let mut abandoned = 0;
        for (id, mut task, source, in_flight) in stopping {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut task).await.is_err() {
                task.abort();
                if in_flight.load(Ordering::SeqCst) {
                    abandoned += 1;
                }
                warn!("Route {} did not drain within {:?}", id, drain_timeout);
            }
            source.close().await;
            debug!("Route {} stopped", id);
        }

        for entry in self.entries().iter_mut() {
            if entry.state == RouteState::Active {
                entry.state = RouteState::Stopped;
            }
        }
        info!("Routing pipeline stopped ({} abandoned)", abandoned);
        abandoned
    }
}

async fn build_sink(
    descriptor: &SinkDescriptor,
    label: &str,
    ctx: &RoutingContext,
) -> Result<Arc<dyn Sink>, RouteError> {
    match descriptor {
        SinkDescriptor::Topic { topic } => {
            let producer = ctx
                .endpoints
                .open_producer(topic, false, &ctx.endpoint_config)
                .await
                .map_err(|e| RouteError::Setup(e.to_string()))?;
            Ok(Arc::new(TopicSink::new(producer)))
        }
        SinkDescriptor::Queue { queue } => {
            ctx.queue_broker
                .declare_queue(queue)
                .await
                .map_err(|e| RouteError::Setup(e.to_string()))?;
            Ok(Arc::new(QueueSink::new(ctx.queue_broker.clone(), queue)))
        }
        SinkDescriptor::Log => Ok(Arc::new(LogSink::new(label))),
    }
}

async fn run_route(
    route: Arc<Route>,
    source: Arc<dyn MessageSource>,
    poll_timeout: Duration,
    mut stop: watch::Receiver<bool>,
    in_flight: Arc<AtomicBool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = source.next(poll_timeout) => next,
        };

        let pause = match next {
            Ok(Some(item)) => {
                in_flight.store(true, Ordering::SeqCst);
                let result = route.process_until(&item.envelope, stopped(&mut stop)).await;
                if let Err(e) = source.settle(item.settlement, &result).await {
                    warn!("Route {}: settling with {} failed: {}", route.id(), source.describe(), e);
                }
                in_flight.store(false, Ordering::SeqCst);
                // the message went back to its source; give the sinks a moment
                result.is_err().then_some(route.policy().initial_backoff)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Route {}: receive from {} failed: {}", route.id(), source.describe(), e);
                Some(poll_timeout)
            }
        };

        if *stop.borrow() {
            break;
        }
        if let Some(pause) = pause {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
    debug!("Route {} loop exited", route.id());
}

/// Completes once stop is requested or the pipeline is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
