use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, client_async};

use super::tests::fixture;
use crate::transport::websocket::serve;

type Client = WebSocketStream<TcpStream>;

async fn connect() -> Client {
    let f = fixture().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, f.ingress));

    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let (ws, _) = client_async(format!("ws://{addr}/"), stream)
        .await
        .expect("WebSocket handshake failed");
    ws
}

async fn request(ws: &mut Client, body: Value) -> Value {
    ws.send(WsMessage::Text(body.to_string().into()))
        .await
        .expect("Failed to send request");
    next_response(ws).await
}

async fn next_response(ws: &mut Client) -> Value {
    let frame = ws
        .next()
        .await
        .expect("Did not receive response")
        .unwrap();
    serde_json::from_slice(&frame.into_data()).unwrap()
}

#[tokio::test]
async fn test_submit_over_websocket() {
    let mut ws = connect().await;

    let first = request(&mut ws, json!({"type": "submit", "payload": "one"})).await;
    let second = request(
        &mut ws,
        json!({"type": "submit", "payload": "two", "key": "user-1"}),
    )
    .await;

    assert_eq!(first, json!({"type": "accepted", "message_id": 1}));
    assert_eq!(second, json!({"type": "accepted", "message_id": 2}));
}

#[tokio::test]
async fn test_responses_keep_request_order() {
    let mut ws = connect().await;

    for body in [
        json!({"type": "submit_batch", "payloads": ["a", "b"]}),
        json!({"type": "inbound", "endpoint": "messages", "payload": "{}"}),
        json!({"type": "stats", "topic": "user-events"}),
    ] {
        ws.send(WsMessage::Text(body.to_string().into()))
            .await
            .unwrap();
    }

    let batch = next_response(&mut ws).await;
    let routed = next_response(&mut ws).await;
    let stats = next_response(&mut ws).await;
    assert_eq!(batch, json!({"type": "batch_accepted", "count": 2}));
    assert_eq!(routed["type"], "routed");
    assert_eq!(routed["outcome"], "delivered");
    assert_eq!(stats["type"], "stats");
    assert_eq!(stats["topic"]["topic"], "user-events");
}

#[tokio::test]
async fn test_invalid_message_keeps_the_session_open() {
    let mut ws = connect().await;

    let invalid = request(&mut ws, json!({"type": "login", "username": "admin"})).await;
    assert_eq!(invalid["type"], "error");
    assert!(
        invalid["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid message")
    );

    ws.send(WsMessage::Text("not json at all".into()))
        .await
        .unwrap();
    assert_eq!(next_response(&mut ws).await["type"], "error");

    let accepted = request(&mut ws, json!({"type": "submit", "payload": "still here"})).await;
    assert_eq!(accepted["type"], "accepted");
}
