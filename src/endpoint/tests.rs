use std::sync::Arc;
use std::time::Duration;

use super::{EndpointConfig, EndpointManager, Role};
use crate::broker::{
    EmbeddedLogBroker, LogBroker, MessageId, OutboundMessage, ReadPosition, SubscriptionMode,
};
use crate::config::Settings;
use crate::utils::error::{BrokerError, EndpointError};

const DRAIN: Duration = Duration::from_secs(1);

fn setup() -> (Arc<EmbeddedLogBroker>, EndpointManager) {
    let broker = Arc::new(EmbeddedLogBroker::temporary(None).unwrap());
    let manager = EndpointManager::new(broker.clone());
    (broker, manager)
}

fn config() -> EndpointConfig {
    EndpointConfig {
        poll_timeout: Duration::from_millis(50),
        read_ahead: Duration::from_millis(50),
        ..EndpointConfig::default()
    }
}

#[tokio::test]
async fn test_open_each_role() {
    let (_broker, manager) = setup();
    let config = config();

    let producer = manager.open("orders", Role::Producer, &config).await.unwrap();
    let batch = manager
        .open("orders", Role::BatchProducer, &config)
        .await
        .unwrap();
    let consumer = manager
        .open(
            "orders",
            Role::Consumer {
                subscription: "billing".into(),
                mode: SubscriptionMode::Shared,
                ack_timeout: Duration::from_secs(30),
            },
            &config,
        )
        .await
        .unwrap();
    let reader = manager
        .open(
            "orders",
            Role::Reader {
                start: ReadPosition::Earliest,
            },
            &config,
        )
        .await
        .unwrap();

    assert!(!producer.as_producer().unwrap().is_batching());
    assert!(batch.as_producer().unwrap().is_batching());
    assert_eq!(consumer.as_consumer().unwrap().subscription(), "billing");
    assert!(reader.as_reader().is_some());
    assert_eq!(reader.topic(), "orders");

    assert_eq!(manager.open_count(), 4);
    assert_eq!(manager.producers().len(), 2);
    assert_eq!(manager.consumers().len(), 1);
}

#[tokio::test]
async fn test_generated_and_configured_producer_names() {
    let (_broker, manager) = setup();

    let generated = manager.open_producer("orders", false, &config()).await.unwrap();
    assert!(generated.name().starts_with("orders-"));
    assert_eq!(generated.name().len(), "orders-".len() + 8);

    let named = manager
        .open_producer("orders", false, &config().with_producer_name("checkout"))
        .await
        .unwrap();
    assert_eq!(named.name(), "checkout");
}

#[tokio::test]
async fn test_shared_producer_name_is_made_unique_per_topic() {
    let (_broker, manager) = setup();
    let config = config().with_producer_name("checkout");

    let first = manager.open_producer("orders", false, &config).await.unwrap();
    let batch = manager.open_producer("orders-batch", true, &config).await.unwrap();
    let sink = manager.open_producer("payments", false, &config).await.unwrap();
    let again = manager.open_producer("payments", false, &config).await.unwrap();

    assert_eq!(first.name(), "checkout");
    assert_eq!(batch.name(), "checkout-orders-batch");
    assert_eq!(sink.name(), "checkout-payments");
    assert_eq!(again.name(), "checkout-payments-2");

    let mut names: Vec<String> = manager
        .producers()
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 4);
}

#[tokio::test]
async fn test_open_fails_when_broker_unreachable() {
    let (broker, manager) = setup();
    broker.disconnect();

    let err = manager
        .open("orders", Role::Producer, &config())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        EndpointError::EndpointUnavailable { topic, source: BrokerError::Unavailable(_) }
            if topic == "orders"
    ));
    assert!(err.is_retryable());
    assert_eq!(manager.open_count(), 0);

    broker.reconnect();
    assert!(manager.open("orders", Role::Producer, &config()).await.is_ok());
}

#[tokio::test]
async fn test_second_exclusive_consumer_is_rejected() {
    let (_broker, manager) = setup();
    let role = Role::Consumer {
        subscription: "solo".into(),
        mode: SubscriptionMode::Exclusive,
        ack_timeout: Duration::from_secs(30),
    };
    manager.open("orders", role.clone(), &config()).await.unwrap();

    let err = manager.open("orders", role, &config()).await.unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Rejected {
            source: BrokerError::ConsumerBusy(_),
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (_broker, manager) = setup();
    let handle = manager
        .open(
            "orders",
            Role::Reader {
                start: ReadPosition::Latest,
            },
            &config(),
        )
        .await
        .unwrap();

    assert_eq!(manager.close(&handle, DRAIN).await, 0);
    assert_eq!(manager.open_count(), 0);
    assert!(handle.as_reader().unwrap().is_closed());

    assert_eq!(manager.close(&handle, DRAIN).await, 0);
    assert_eq!(manager.open_count(), 0);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_sends_and_blocks_new_endpoints() {
    let (broker, manager) = setup();
    let producer = manager.open_producer("orders", true, &config()).await.unwrap();
    manager
        .open_reader("orders", ReadPosition::Earliest, &config())
        .await
        .unwrap();

    let receipt = producer.send(OutboundMessage::new("last words"));

    let report = manager.shutdown(DRAIN).await;
    assert_eq!(report.closed, 2);
    assert_eq!(report.abandoned, 0);
    assert_eq!(receipt.await.unwrap(), MessageId(1));
    assert!(producer.is_closed());

    let stats = broker.topic_stats("orders").await.unwrap();
    assert_eq!(stats.retained_messages, 1);

    assert_eq!(
        manager
            .open("orders", Role::Producer, &config())
            .await
            .unwrap_err(),
        EndpointError::ShutDown
    );
    assert_eq!(manager.shutdown(DRAIN).await.closed, 0);
}

#[tokio::test]
async fn test_open_defaults_from_settings() {
    let (broker, manager) = setup();
    let mut settings = Settings::default();
    settings.consumer.poll_timeout_ms = 50;
    settings.log_broker.read_ahead_ms = 50;

    let defaults = manager.open_defaults(&settings).await.unwrap();
    assert_eq!(defaults.producer.topic(), "user-events");
    assert!(!defaults.producer.is_batching());
    assert_eq!(defaults.batch_producer.topic(), "batch-events");
    assert!(defaults.batch_producer.is_batching());
    assert_eq!(defaults.consumer.mode(), SubscriptionMode::Exclusive);
    assert_eq!(defaults.batch_consumer.mode(), SubscriptionMode::Shared);
    assert_eq!(defaults.batch_reader.topic(), "batch-events");
    assert_eq!(manager.open_count(), 5);

    let stats = broker.topic_stats("user-events").await.unwrap();
    assert_eq!(stats.subscriptions[0].name, "relaymq-subscription");
    assert_eq!(stats.subscriptions[0].consumers, 1);

    let report = manager.shutdown(DRAIN).await;
    assert_eq!(report.closed, 5);
}
