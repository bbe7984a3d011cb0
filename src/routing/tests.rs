use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::*;
use crate::broker::{
    EmbeddedLogBroker, InMemoryQueueBroker, LogBroker, OutboundMessage, QueueBroker,
    QueueMessage, ReadPosition, SubscriptionMode,
};
use crate::config::{RetrySettings, RouteSettings};
use crate::endpoint::{EndpointConfig, EndpointManager};
use crate::utils::error::RouteError;

/// Fails the first `failures` deliveries, then accepts.
struct FlakySink {
    failures: u32,
    transient: bool,
    attempts: AtomicU32,
    delivered: Mutex<Vec<Envelope>>,
}

impl FlakySink {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            transient: true,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            failures: u32::MAX,
            transient: false,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FlakySink {
    fn describe(&self) -> String {
        "flaky".to_string()
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<(), RouteError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(RouteError::sink("connection refused", self.transient));
        }
        self.delivered.lock().await.push(envelope.clone());
        Ok(())
    }
}

fn route(sink: Arc<FlakySink>, dead_letter: Arc<FlakySink>, format: MessageFormat) -> Route {
    Route::new(
        "test-route",
        format,
        Arc::new(Passthrough),
        sink,
        dead_letter,
        RetryPolicy::default(),
    )
}

#[test]
fn test_backoff_grows_exponentially() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff(1), Duration::from_millis(1000));
    assert_eq!(policy.backoff(2), Duration::from_millis(2000));
    assert_eq!(policy.backoff(3), Duration::from_millis(4000));
    assert!(policy.allows_retry(2));
    assert!(!policy.allows_retry(3));

    let clamped = RetryPolicy::new(0, Duration::from_millis(10), 0.5);
    assert_eq!(clamped.max_attempts, 1);
    assert_eq!(clamped.backoff(4), Duration::from_millis(10));
}

#[test]
fn test_json_format_normalizes_and_rejects_garbage() {
    let body = MessageFormat::Json.decode(br#"{ "a" : 1 }"#).unwrap();
    assert_eq!(body, Body::Json(json!({"a": 1})));
    assert_eq!(MessageFormat::Json.encode(&body).unwrap(), br#"{"a":1}"#);

    assert!(matches!(
        MessageFormat::Json.decode(b"not json"),
        Err(RouteError::MalformedMessage(_))
    ));
    assert_eq!(
        MessageFormat::Raw.decode(b"not json").unwrap(),
        Body::Raw(b"not json".to_vec())
    );
}

#[tokio::test(start_paused = true)]
async fn test_sink_failing_twice_then_succeeding_delivers_once() {
    let sink = FlakySink::new(2);
    let dlq = FlakySink::new(0);
    let route = route(sink.clone(), dlq.clone(), MessageFormat::Json);

    let outcome = route.process(&Envelope::new(r#"{"user":1}"#)).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Delivered {
            attempts: 3,
            waits: vec![Duration::from_millis(1000), Duration::from_millis(2000)],
        }
    );
    assert_eq!(sink.attempts(), 3);
    assert_eq!(sink.delivered.lock().await.len(), 1);
    assert_eq!(dlq.attempts(), 0);

    let counters = route.counters();
    assert_eq!((counters.delivered, counters.retries), (1, 2));
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_sink_dead_letters_after_backoff() {
    let sink = FlakySink::always_failing();
    let dlq = FlakySink::new(0);
    let route = route(sink.clone(), dlq.clone(), MessageFormat::Json);

    let mut properties = HashMap::new();
    properties.insert("origin".to_string(), "api".to_string());
    let envelope = Envelope::new(r#"{"user": 7}"#).with_properties(properties);

    let started = Instant::now();
    let outcome = route.process(&envelope).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        outcome,
        ProcessOutcome::DeadLettered {
            attempts: 3,
            waits: vec![Duration::from_millis(1000), Duration::from_millis(2000)],
            reason: DeadLetterReason::Exhausted,
        }
    );
    assert!(elapsed >= Duration::from_millis(3000));
    assert!(elapsed < Duration::from_millis(3100));
    assert_eq!(sink.attempts(), 3);

    let dead = dlq.delivered.lock().await;
    assert_eq!(dead.len(), 1);
    // the original bytes, not the re-encoded ones
    assert_eq!(dead[0].payload, br#"{"user": 7}"#);
    assert_eq!(dead[0].properties["origin"], "api");
    assert_eq!(dead[0].properties[DEAD_LETTER_ATTEMPTS], "3");
    assert_eq!(dead[0].properties[DEAD_LETTER_REASON], "exhausted");
    assert_eq!(dead[0].properties[DEAD_LETTER_ROUTE], "test-route");
    assert!(dead[0].properties[DEAD_LETTER_ERROR].contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_is_dead_lettered_without_retries() {
    let sink = FlakySink::new(0);
    let dlq = FlakySink::new(0);
    let route = route(sink.clone(), dlq.clone(), MessageFormat::Json);

    let started = Instant::now();
    let outcome = route.process(&Envelope::new("{broken")).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::DeadLettered {
            attempts: 0,
            waits: Vec::new(),
            reason: DeadLetterReason::Malformed,
        }
    );
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(sink.attempts(), 0);
    assert_eq!(
        dlq.delivered.lock().await[0].properties[DEAD_LETTER_REASON],
        "malformed"
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_delivery_is_not_retried() {
    let sink = FlakySink::rejecting();
    let dlq = FlakySink::new(0);
    let route = route(sink.clone(), dlq.clone(), MessageFormat::Raw);

    let outcome = route.process(&Envelope::new("payload")).await.unwrap();
    assert_eq!(outcome.attempts(), 1);
    assert!(outcome.waits().is_empty());
    assert!(matches!(
        outcome,
        ProcessOutcome::DeadLettered {
            reason: DeadLetterReason::Rejected,
            ..
        }
    ));
    assert_eq!(sink.attempts(), 1);
}

#[tokio::test]
async fn test_transform_runs_between_decode_and_delivery() {
    let sink = FlakySink::new(0);
    let dlq = FlakySink::new(0);
    let route = Route::new(
        "enrich",
        MessageFormat::Json,
        Arc::new(transform_fn(|body| match body {
            Body::Json(mut value) => {
                value["seen"] = json!(true);
                Ok(Body::Json(value))
            }
            Body::Raw(_) => Err(RouteError::TransformFailure("expected json".into())),
        })),
        sink.clone(),
        dlq.clone(),
        RetryPolicy::default(),
    );

    route.process(&Envelope::new(r#"{"id":1}"#)).await.unwrap();
    let delivered = sink.delivered.lock().await;
    let value: serde_json::Value = serde_json::from_slice(&delivered[0].payload).unwrap();
    assert_eq!(value, json!({"id": 1, "seen": true}));
}

#[tokio::test]
async fn test_transform_failure_goes_to_dead_letter() {
    let sink = FlakySink::new(0);
    let dlq = FlakySink::new(0);
    let route = Route::new(
        "strict",
        MessageFormat::Raw,
        Arc::new(transform_fn(|_| Err(RouteError::TransformFailure("nope".into())))),
        sink.clone(),
        dlq.clone(),
        RetryPolicy::default(),
    );

    let outcome = route.process(&Envelope::new("x")).await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::DeadLettered {
            attempts: 0,
            reason: DeadLetterReason::Transform,
            ..
        }
    ));
    assert_eq!(sink.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_failure_is_reported() {
    let route = route(
        FlakySink::rejecting(),
        FlakySink::rejecting(),
        MessageFormat::Raw,
    );
    let err = route.process(&Envelope::new("x")).await.unwrap_err();
    assert!(matches!(err, RouteError::DeadLetterFailed(_)));
    assert_eq!(route.counters().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_caller_gets_the_outcome() {
    let dlq = FlakySink::new(0);
    let pipeline = RoutingPipeline::new(Duration::from_millis(50));
    let (source, handle) = InboundSource::channel("messages", 4);
    pipeline.spawn(
        route(FlakySink::always_failing(), dlq.clone(), MessageFormat::Raw),
        Arc::new(source),
    );

    let outcome = handle.submit(Envelope::new("hello")).await.unwrap();
    assert_eq!(outcome.label(), "dead_lettered");
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(dlq.delivered.lock().await.len(), 1);

    assert_eq!(pipeline.stop(Duration::from_secs(1)).await, 0);
    assert_eq!(pipeline.state("test-route"), Some(RouteState::Stopped));
    assert!(matches!(
        handle.submit(Envelope::new("late")).await,
        Err(RouteError::Setup(_))
    ));
}

fn slow_retry_route(sink: Arc<FlakySink>, dead_letter: Arc<FlakySink>) -> Route {
    Route::new(
        "slow-route",
        MessageFormat::Raw,
        Arc::new(Passthrough),
        sink,
        dead_letter,
        RetryPolicy::new(3, Duration::from_secs(10), 2.0),
    )
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_retry_backoff() {
    let sink = FlakySink::always_failing();
    let dlq = FlakySink::new(0);
    let route = slow_retry_route(sink.clone(), dlq.clone());

    let started = Instant::now();
    let err = route
        .process_until(
            &Envelope::new("x"),
            tokio::time::sleep(Duration::from_secs(15)),
        )
        .await
        .unwrap_err();

    assert_eq!(err, RouteError::Interrupted(2));
    assert!(!err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(16));
    assert_eq!(sink.attempts(), 2);
    assert!(dlq.delivered.lock().await.is_empty());
    assert_eq!(route.counters().dead_lettered, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_stop_does_not_wait_out_the_backoff() {
    let sink = FlakySink::always_failing();
    let dlq = FlakySink::new(0);
    let pipeline = RoutingPipeline::new(Duration::from_millis(50));
    let (source, handle) = InboundSource::channel("messages", 4);
    pipeline.spawn(slow_retry_route(sink.clone(), dlq.clone()), Arc::new(source));

    let caller = tokio::spawn(async move { handle.submit(Envelope::new("hello")).await });
    while sink.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let started = Instant::now();
    assert_eq!(pipeline.stop(Duration::from_secs(60)).await, 0);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(caller.await.unwrap(), Err(RouteError::Interrupted(1)));
    assert_eq!(sink.attempts(), 1);
    assert!(dlq.delivered.lock().await.is_empty());
    assert_eq!(pipeline.state("slow-route"), Some(RouteState::Stopped));
}

struct Harness {
    log: Arc<EmbeddedLogBroker>,
    queue: Arc<InMemoryQueueBroker>,
    ctx: RoutingContext,
}

fn harness() -> Harness {
    let log = Arc::new(EmbeddedLogBroker::temporary(None).unwrap());
    let queue = Arc::new(InMemoryQueueBroker::new("amqp://guest@localhost:5672"));
    let ctx = RoutingContext {
        endpoints: Arc::new(EndpointManager::new(log.clone())),
        queue_broker: queue.clone(),
        endpoint_config: EndpointConfig {
            poll_timeout: Duration::from_millis(50),
            read_ahead: Duration::from_millis(50),
            ..EndpointConfig::default()
        },
        ack_timeout: Duration::from_secs(30),
    };
    Harness { log, queue, ctx }
}

fn settings(id: &str, source: SourceDescriptor, sink: SinkDescriptor, format: MessageFormat) -> RouteSettings {
    RouteSettings {
        id: id.to_string(),
        source,
        sink,
        dead_letter: SinkDescriptor::Log,
        format,
        retry: RetrySettings::default(),
    }
}

#[tokio::test]
async fn test_pipeline_bridges_topic_to_queue() {
    let h = harness();
    let routes = vec![settings(
        "log-to-queue",
        SourceDescriptor::Subscription {
            topic: "user-events".into(),
            subscription: "bridge".into(),
            mode: SubscriptionMode::Shared,
            ack_timeout_secs: None,
        },
        SinkDescriptor::Queue {
            queue: "user-events".into(),
        },
        MessageFormat::Json,
    )];
    let pipeline = RoutingPipeline::start(&routes, &h.ctx).await;
    assert_eq!(pipeline.state("log-to-queue"), Some(RouteState::Active));

    h.log
        .publish_batch(
            "user-events",
            vec![OutboundMessage::new(r#"{"name": "ada"}"#).property("source", "signup")],
        )
        .await
        .unwrap();

    let delivery = h
        .queue
        .consume("user-events", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("bridged message");
    assert_eq!(delivery.body, br#"{"name":"ada"}"#);
    assert_eq!(delivery.headers["source"], "signup");

    pipeline.stop(Duration::from_secs(1)).await;
    let stats = pipeline.stats();
    assert_eq!(stats[0].counters.as_ref().unwrap().delivered, 1);

    let topic = h.log.topic_stats("user-events").await.unwrap();
    assert_eq!(topic.subscriptions[0].backlog, 0);
}

#[tokio::test]
async fn test_pipeline_routes_inbound_requests_and_queues() {
    let h = harness();
    let routes = vec![
        settings(
            "inbound-to-log",
            SourceDescriptor::Inbound {
                endpoint: "messages".into(),
            },
            SinkDescriptor::Topic {
                topic: "user-events".into(),
            },
            MessageFormat::Raw,
        ),
        settings(
            "queue-to-log",
            SourceDescriptor::Queue {
                queue: "work".into(),
            },
            SinkDescriptor::Topic {
                topic: "work-log".into(),
            },
            MessageFormat::Raw,
        ),
    ];
    let pipeline = RoutingPipeline::start(&routes, &h.ctx).await;

    let handle = pipeline.inbound("messages").expect("inbound endpoint");
    let outcome = handle.submit(Envelope::new("plain text")).await.unwrap();
    assert_eq!(outcome.label(), "delivered");
    assert!(pipeline.inbound("nowhere").is_none());

    h.queue
        .publish("work", QueueMessage::new("job-1"))
        .await
        .unwrap();
    let reader = h
        .ctx
        .endpoints
        .open_reader("work-log", ReadPosition::Earliest, &h.ctx.endpoint_config)
        .await
        .unwrap();
    let mut found = None;
    for _ in 0..100 {
        if let Some(message) = reader.next().await.unwrap() {
            found = Some(message);
            break;
        }
    }
    assert_eq!(found.expect("routed from queue").payload(), b"job-1");

    let topic = h.log.topic_stats("user-events").await.unwrap();
    assert_eq!(topic.retained_messages, 1);

    pipeline.stop(Duration::from_secs(1)).await;
    let queue = h.queue.queue_stats("work").await.unwrap();
    assert_eq!((queue.ready, queue.unacked, queue.acked), (0, 0, 1));
}

#[tokio::test]
async fn test_unbuildable_route_is_suspended_others_run() {
    let h = harness();
    let routes = vec![
        settings(
            "first",
            SourceDescriptor::Inbound {
                endpoint: "messages".into(),
            },
            SinkDescriptor::Log,
            MessageFormat::Raw,
        ),
        settings(
            "duplicate",
            SourceDescriptor::Inbound {
                endpoint: "messages".into(),
            },
            SinkDescriptor::Log,
            MessageFormat::Raw,
        ),
    ];
    h.queue.disconnect();
    let mut routes = routes;
    routes.push(settings(
        "needs-queue",
        SourceDescriptor::Queue {
            queue: "offline".into(),
        },
        SinkDescriptor::Log,
        MessageFormat::Raw,
    ));

    let pipeline = RoutingPipeline::start(&routes, &h.ctx).await;
    let states: HashMap<_, _> = pipeline.states().into_iter().collect();
    assert_eq!(states["first"], RouteState::Active);
    assert!(matches!(states["duplicate"], RouteState::Suspended { .. }));
    assert!(matches!(states["needs-queue"], RouteState::Suspended { .. }));

    let outcome = pipeline
        .inbound("messages")
        .unwrap()
        .submit(Envelope::new("still routed"))
        .await
        .unwrap();
    assert_eq!(outcome.attempts(), 1);

    pipeline.stop(Duration::from_secs(1)).await;
    let states: HashMap<_, _> = pipeline.states().into_iter().collect();
    assert_eq!(states["first"], RouteState::Stopped);
    // suspended routes stay suspended
    assert!(matches!(states["needs-queue"], RouteState::Suspended { .. }));
}
