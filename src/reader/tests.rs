use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::PositionalReader;
use crate::broker::{
    EmbeddedLogBroker, LogBroker, Message, MessageId, OutboundMessage, ReadPosition,
    SubscriptionMode,
};
use crate::consumer::handler_fn;
use crate::utils::error::{HandlerError, ReadError};

const READ_AHEAD: Duration = Duration::from_millis(100);

async fn seeded(payloads: &[&str], retention: Option<usize>) -> Arc<EmbeddedLogBroker> {
    let broker = Arc::new(EmbeddedLogBroker::temporary(retention).unwrap());
    broker
        .publish_batch(
            "history",
            payloads.iter().map(|p| OutboundMessage::new(*p)).collect(),
        )
        .await
        .unwrap();
    broker
}

async fn reader(broker: &Arc<EmbeddedLogBroker>, start: ReadPosition) -> PositionalReader {
    PositionalReader::open(broker.clone(), "history", start, READ_AHEAD)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reads_from_earliest_in_order() {
    let broker = seeded(&["a", "b", "c"], None).await;
    let reader = reader(&broker, ReadPosition::Earliest).await;
    assert_eq!(reader.current_position().await, ReadPosition::Earliest);

    let mut seen = Vec::new();
    while reader.has_next().await.unwrap() {
        let msg = reader.next().await.unwrap().unwrap();
        seen.push(msg.payload_str().into_owned());
    }
    assert_eq!(seen, vec!["a", "b", "c"]);
    assert_eq!(
        reader.current_position().await,
        ReadPosition::Message(MessageId(3))
    );
    assert!(reader.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_latest_only_sees_new_messages() {
    let broker = seeded(&["old"], None).await;
    let reader = reader(&broker, ReadPosition::Latest).await;
    assert!(!reader.has_next().await.unwrap());

    broker
        .publish_batch("history", vec![OutboundMessage::new("new")])
        .await
        .unwrap();
    let msg = reader.next().await.unwrap().unwrap();
    assert_eq!(msg.payload(), b"new");
}

#[tokio::test]
async fn test_start_after_specific_message() {
    let broker = seeded(&["a", "b", "c"], None).await;
    let reader = reader(&broker, ReadPosition::Message(MessageId(1))).await;
    assert_eq!(reader.next().await.unwrap().unwrap().id(), MessageId(2));
}

#[tokio::test]
async fn test_readers_are_independent_of_subscriptions() {
    let broker = seeded(&["a", "b"], None).await;
    let key = broker
        .subscribe(
            "history",
            "sub",
            SubscriptionMode::Exclusive,
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    let msg = broker.receive(&key, READ_AHEAD).await.unwrap().unwrap();
    broker.acknowledge(&key, msg.id()).await.unwrap();

    let first = reader(&broker, ReadPosition::Earliest).await;
    let second = reader(&broker, ReadPosition::Earliest).await;
    assert_eq!(first.next().await.unwrap().unwrap().id(), MessageId(1));
    assert_eq!(first.next().await.unwrap().unwrap().id(), MessageId(2));
    // the other reader still starts at the beginning
    assert_eq!(second.next().await.unwrap().unwrap().id(), MessageId(1));

    let stats = broker.topic_stats("history").await.unwrap();
    assert_eq!(stats.subscriptions.len(), 1);
    assert_eq!(stats.subscriptions[0].backlog, 1);
}

#[tokio::test]
async fn test_trimmed_position_reports_expired_and_seek_recovers() {
    let broker = seeded(&["1", "2", "3", "4", "5"], Some(2)).await;
    let reader = reader(&broker, ReadPosition::Message(MessageId(1))).await;

    assert_eq!(
        reader.next().await.unwrap_err(),
        ReadError::PositionExpired {
            requested: MessageId(1),
            earliest_available: Some(MessageId(4)),
        }
    );

    reader.seek(ReadPosition::Earliest).await.unwrap();
    assert_eq!(reader.next().await.unwrap().unwrap().id(), MessageId(4));
}

#[tokio::test]
async fn test_closed_reader_fails() {
    let broker = seeded(&["a"], None).await;
    let reader = reader(&broker, ReadPosition::Earliest).await;
    assert!(reader.close());
    assert!(!reader.close());
    assert_eq!(reader.next().await.unwrap_err(), ReadError::Closed);
}

#[tokio::test]
async fn test_drain_replays_everything_then_finishes() {
    let broker = seeded(&["a", "b", "c"], None).await;
    let reader = Arc::new(reader(&broker, ReadPosition::Earliest).await);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let task = reader.clone().drain(handler_fn(move |msg: Message| {
        let sink = sink.clone();
        async move {
            if msg.payload() == b"b" {
                return Err(HandlerError::new("skip b"));
            }
            sink.lock().await.push(msg.payload_str().into_owned());
            Ok(())
        }
    }));

    let summary = task.join().await.unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.last_position, ReadPosition::Message(MessageId(3)));
    assert_eq!(*seen.lock().await, vec!["a", "c"]);
}

#[tokio::test]
async fn test_drain_can_be_stopped() {
    let broker = Arc::new(EmbeddedLogBroker::temporary(None).unwrap());
    let reader = Arc::new(
        PositionalReader::open(
            broker.clone(),
            "history",
            ReadPosition::Earliest,
            Duration::from_secs(60),
        )
        .await
        .unwrap(),
    );
    let task = reader
        .clone()
        .drain(handler_fn(|_msg: Message| async { Ok::<_, HandlerError>(()) }));

    let summary = task.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.last_position, ReadPosition::Earliest);
}
