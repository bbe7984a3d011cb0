//! WebSocket ingress
//!
//! Accepts TCP/WebSocket connections and translates the JSON protocol of
//! [`ClientMessage`] into producer sends, inbound route requests and stats
//! queries. Every request gets exactly one [`ServerMessage`] back, in order.
//!
//! There is no authentication on this surface; bind it to a trusted interface.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::OutboundMessage;
use crate::producer::Producer;
use crate::routing::{Envelope, RoutingPipeline};
use crate::stats::StatsCollector;
use crate::transport::message::{ClientMessage, ServerMessage};

/// What the ingress forwards requests to.
#[derive(Debug, Clone)]
pub struct Ingress {
    pub producer: Arc<Producer>,
    pub batch_producer: Arc<Producer>,
    pub pipeline: Arc<RoutingPipeline>,
    pub stats: StatsCollector,
}

/// Binds `addr` and serves connections until the listener fails.
pub async fn start_websocket_server(addr: &str, ingress: Ingress) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Ingress listening on ws://{}", listener.local_addr()?);
    serve(listener, ingress).await;
    Ok(())
}

pub async fn serve(listener: TcpListener, ingress: Ingress) {
    while let Ok((stream, peer)) = listener.accept().await {
        let ingress = ingress.clone();
        let session_id = format!("session-{}", Uuid::new_v4());

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            debug!("{} connected from {}", session_id, peer);
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

            {
                let session_id = session_id.clone();
                spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if let Err(e) = ws_sender.send(msg).await {
                            warn!("Failed to send to {}: {}", session_id, e);
                            break;
                        }
                    }
                    debug!("Send loop closed for {}", session_id);
                });
            }

            while let Some(Ok(msg)) = ws_receiver.next().await {
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                let response = match serde_json::from_str::<ClientMessage>(text) {
                    Ok(request) => handle_request(&ingress, request).await,
                    Err(err) => {
                        warn!(
                            "Invalid message from {}: {} | {}",
                            session_id,
                            err,
                            text.chars().take(100).collect::<String>()
                        );
                        ServerMessage::error(format!("invalid message: {err}"))
                    }
                };
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if tx.send(WsMessage::Text(json.into())).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Could not encode response for {}: {}", session_id, e),
                }
            }

            debug!("{} disconnected", session_id);
        });
    }
}

/// Runs one request against the ingress targets.
pub async fn handle_request(ingress: &Ingress, request: ClientMessage) -> ServerMessage {
    match request {
        ClientMessage::Submit {
            payload,
            key,
            properties,
            delay_ms,
            compression,
        } => {
            let mut message = OutboundMessage::new(payload).properties(properties);
            if let Some(key) = key {
                message = message.key(key);
            }
            if let Some(delay) = delay_ms {
                message = message.deliver_after(Duration::from_millis(delay));
            }
            if let Some(hint) = compression {
                message = message.compression(hint);
            }
            match ingress.producer.send(message).await {
                Ok(message_id) => ServerMessage::Accepted { message_id },
                Err(e) => ServerMessage::error(e.to_string()),
            }
        }
        ClientMessage::SubmitBatch { payloads } => {
            let count = payloads.len();
            let receipts = ingress
                .batch_producer
                .send_all(payloads.into_iter().map(OutboundMessage::new));
            let topic = ingress.batch_producer.topic().to_string();
            spawn(async move {
                for receipt in receipts {
                    if let Err(e) = receipt.await {
                        warn!("Batch message for '{}' failed: {}", topic, e);
                    }
                }
            });
            ServerMessage::BatchAccepted { count }
        }
        ClientMessage::Inbound {
            endpoint,
            payload,
            properties,
        } => {
            let Some(handle) = ingress.pipeline.inbound(&endpoint) else {
                return ServerMessage::error(format!("no route bound to endpoint '{endpoint}'"));
            };
            match handle
                .submit(Envelope::new(payload).with_properties(properties))
                .await
            {
                Ok(outcome) => ServerMessage::Routed {
                    outcome: outcome.label().to_string(),
                    attempts: outcome.attempts(),
                },
                Err(e) => ServerMessage::error(e.to_string()),
            }
        }
        ClientMessage::Stats { topic } => match ingress.stats.snapshot(&topic).await {
            Ok(snapshot) => ServerMessage::Stats(snapshot),
            Err(e) => ServerMessage::error(e.to_string()),
        },
    }
}
