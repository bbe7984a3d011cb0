//! The `reader` module provides positional readers.
//!
//! A reader walks a topic in order from a start position without
//! acknowledging anything, so it never affects subscriptions or other
//! readers. `next` waits at most the read-ahead window for a message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{LogBroker, Message, ReadPosition};
use crate::consumer::MessageHandler;
use crate::utils::error::{BrokerError, ReadError};

#[derive(Debug)]
struct Cursor {
    position: ReadPosition,
    peeked: Option<Message>,
}

/// Sequential reader over one topic.
#[derive(Debug)]
pub struct PositionalReader {
    broker: Arc<dyn LogBroker>,
    topic: String,
    read_ahead: Duration,
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
}

impl PositionalReader {
    /// Opens a reader. `Latest` is fixed here to the last message currently
    /// in the topic, so only later messages are read.
    pub async fn open(
        broker: Arc<dyn LogBroker>,
        topic: &str,
        start: ReadPosition,
        read_ahead: Duration,
    ) -> Result<Self, BrokerError> {
        broker.ensure_topic(topic).await?;
        let position = broker.resolve_position(topic, start).await?;
        debug!("Reader on '{}' starts at {:?}", topic, position);
        Ok(Self {
            broker,
            topic: topic.to_string(),
            read_ahead,
            cursor: Mutex::new(Cursor {
                position,
                peeked: None,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn check_open(&self) -> Result<(), ReadError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ReadError::Closed)
        } else {
            Ok(())
        }
    }

    /// Whether a message is available within the read-ahead window. The
    /// message is kept for the following `next`.
    pub async fn has_next(&self) -> Result<bool, ReadError> {
        self.check_open()?;
        let mut cursor = self.cursor.lock().await;
        if cursor.peeked.is_none() {
            cursor.peeked = self
                .broker
                .read(&self.topic, cursor.position, self.read_ahead)
                .await?;
        }
        Ok(cursor.peeked.is_some())
    }

    /// The next message, or `None` if none arrived within the read-ahead window.
    pub async fn next(&self) -> Result<Option<Message>, ReadError> {
        self.check_open()?;
        let mut cursor = self.cursor.lock().await;
        let message = match cursor.peeked.take() {
            Some(message) => Some(message),
            None => {
                self.broker
                    .read(&self.topic, cursor.position, self.read_ahead)
                    .await?
            }
        };
        if let Some(message) = &message {
            cursor.position = ReadPosition::Message(message.id());
        }
        Ok(message)
    }

    /// `Earliest` until the first message is read, then the id of the last
    /// message returned by `next`.
    pub async fn current_position(&self) -> ReadPosition {
        self.cursor.lock().await.position
    }

    /// Moves the reader. A position inside a trimmed range fails on the next read.
    pub async fn seek(&self, position: ReadPosition) -> Result<(), ReadError> {
        self.check_open()?;
        let position = self.broker.resolve_position(&self.topic, position).await?;
        let mut cursor = self.cursor.lock().await;
        cursor.position = position;
        cursor.peeked = None;
        Ok(())
    }

    /// Further reads fail with `ReadError::Closed`. Closing twice is a no-op.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            info!("Reader on '{}' closed", self.topic);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawns a replay task that hands every message to `handler` until the
    /// topic has nothing more within the read-ahead window, the task is
    /// stopped, or the reader is closed.
    pub fn drain(self: Arc<Self>, handler: impl MessageHandler) -> ReaderTask {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(drain_loop(self, Arc::new(handler), stop_rx));
        ReaderTask { stop_tx, task }
    }
}

/// Outcome of a replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub delivered: u64,
    pub failed: u64,
    pub last_position: ReadPosition,
    pub error: Option<String>,
}

/// Handle to a running replay.
#[derive(Debug)]
pub struct ReaderTask {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<ReplaySummary>,
}

impl ReaderTask {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the replay to finish on its own.
    pub async fn join(self) -> Option<ReplaySummary> {
        self.task.await.ok()
    }

    /// Stops after the in-flight message, waiting at most `drain_timeout`.
    /// Returns `None` if the task had to be aborted.
    pub async fn stop(mut self, drain_timeout: Duration) -> Option<ReplaySummary> {
        self.stop_tx.send_replace(true);
        match timeout(drain_timeout, &mut self.task).await {
            Ok(summary) => summary.ok(),
            Err(_) => {
                self.task.abort();
                None
            }
        }
    }
}

async fn drain_loop(
    reader: Arc<PositionalReader>,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) -> ReplaySummary {
    let mut delivered = 0;
    let mut failed = 0;
    let mut error = None;

    loop {
        if *stop.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = reader.next() => next,
        };
        match next {
            Ok(Some(message)) => match handler.handle(&message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!("Replay handler failed for {}: {}", message.id(), e);
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Replay of '{}' stopped: {}", reader.topic(), e);
                error = Some(e.to_string());
                break;
            }
        }
    }

    let last_position = reader.current_position().await;
    info!(
        "Replay of '{}' finished: {} delivered, {} failed",
        reader.topic(),
        delivered,
        failed
    );
    ReplaySummary {
        delivered,
        failed,
        last_position,
        error,
    }
}

#[cfg(test)]
mod tests;
