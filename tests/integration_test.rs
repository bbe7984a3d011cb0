use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relaymq::broker::{EmbeddedLogBroker, InMemoryQueueBroker, QueueBroker};
use relaymq::config::Settings;
use relaymq::endpoint::{EndpointConfig, EndpointManager};
use relaymq::routing::{RouteState, RoutingContext, RoutingPipeline};
use relaymq::stats::StatsCollector;
use relaymq::transport::{Ingress, serve};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn settings(data_dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.log_broker.data_dir = data_dir.to_string_lossy().into_owned();
    settings.log_broker.read_ahead_ms = 50;
    settings.consumer.poll_timeout_ms = 50;
    settings
}

#[tokio::test]
async fn integration_inbound_request_reaches_topic_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());

    let log_broker = Arc::new(EmbeddedLogBroker::open(&settings.log_broker).unwrap());
    let queue_broker = Arc::new(InMemoryQueueBroker::connect(&settings.queue_broker).unwrap());
    let endpoints = Arc::new(EndpointManager::new(log_broker));
    let defaults = endpoints.open_defaults(&settings).await.unwrap();

    let ctx = RoutingContext {
        endpoints: endpoints.clone(),
        queue_broker: queue_broker.clone(),
        endpoint_config: EndpointConfig::from_settings(&settings),
        ack_timeout: settings.consumer.ack_timeout(),
    };
    let pipeline = Arc::new(RoutingPipeline::start(&settings.routes, &ctx).await);
    for (id, state) in pipeline.states() {
        assert_eq!(state, RouteState::Active, "route {id}");
    }

    let ingress = Ingress {
        producer: defaults.producer.clone(),
        batch_producer: defaults.batch_producer.clone(),
        pipeline: pipeline.clone(),
        stats: StatsCollector::new(endpoints.clone())
            .with_queue_broker(queue_broker.clone())
            .with_pipeline(pipeline.clone()),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, ingress));

    let (mut ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("client connect");
    let request = json!({
        "type": "inbound",
        "endpoint": "messages",
        "payload": r#"{"user":"ada"}"#,
        "properties": {"source": "integration"}
    });
    ws.send(WsMessage::Text(request.to_string().into()))
        .await
        .unwrap();
    let Some(Ok(WsMessage::Text(reply))) = ws.next().await else {
        panic!("no reply to the inbound request");
    };
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply, json!({"type": "routed", "outcome": "delivered", "attempts": 1}));

    // inbound-to-log wrote to the events topic, which the default consumer reads
    let message = defaults
        .consumer
        .receive(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("message on the events topic");
    assert_eq!(message.payload_str(), r#"{"user":"ada"}"#);
    assert_eq!(message.property("source"), Some("integration"));
    defaults.consumer.acknowledge(&message).await.unwrap();

    // log-to-queue bridges it to the queue, where queue-consumer acks it
    let mut acked = 0;
    for _ in 0..100 {
        acked = queue_broker.queue_stats("user-events").await.unwrap().acked;
        if acked == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(acked, 1);

    ws.send(WsMessage::Text(
        json!({"type": "stats", "topic": "user-events"}).to_string().into(),
    ))
    .await
    .unwrap();
    let Some(Ok(WsMessage::Text(stats))) = ws.next().await else {
        panic!("no reply to the stats request");
    };
    let stats: Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(stats["topic"]["retained_messages"], 1);
    assert_eq!(stats["routes"].as_array().unwrap().len(), 3);

    assert_eq!(pipeline.stop(Duration::from_secs(2)).await, 0);
    let report = endpoints.shutdown(Duration::from_secs(2)).await;
    assert_eq!(report.abandoned, 0);
    assert_eq!(endpoints.open_count(), 0);
}
