//! The `producer` module provides the batching producer.
//!
//! A `Producer` is a handle to a single actor task that owns the outgoing
//! buffer. `send` only enqueues a command and hands back a `SendReceipt`;
//! the actor flushes the buffer to the broker when it reaches
//! `max_batch_messages`, or when `max_batch_delay` has elapsed since the
//! first buffered message, whichever comes first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::engine::now_ms;
use crate::broker::{LogBroker, MessageId, OutboundMessage};
use crate::utils::error::SendError;

/// Batching thresholds of one producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub name: String,
    pub max_batch_messages: usize,
    pub max_batch_delay: Duration,
}

impl ProducerConfig {
    pub fn batched(name: impl Into<String>, max_batch_messages: usize, max_batch_delay: Duration) -> Self {
        Self {
            name: name.into(),
            max_batch_messages: max_batch_messages.max(1),
            max_batch_delay,
        }
    }

    /// Every send is flushed on its own.
    pub fn unbatched(name: impl Into<String>) -> Self {
        Self::batched(name, 1, Duration::ZERO)
    }

    pub fn is_batching(&self) -> bool {
        self.max_batch_messages > 1 && !self.max_batch_delay.is_zero()
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self::batched(format!("producer-{}", Uuid::new_v4()), 1000, Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProducerStats {
    pub producer_name: String,
    pub topic: String,
    /// Sends not yet acknowledged by the broker.
    pub pending: usize,
    pub sent: u64,
    pub send_errors: u64,
    pub batches_flushed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    sent: AtomicU64,
    send_errors: AtomicU64,
    batches_flushed: AtomicU64,
}

type Reply = oneshot::Sender<Result<MessageId, SendError>>;

enum Command {
    Send { message: OutboundMessage, reply: Reply },
    Flush { done: oneshot::Sender<()> },
    Close { done: oneshot::Sender<usize> },
}

/// Resolves once the broker accepted or refused the message.
///
/// Dropping a receipt does not cancel the send.
#[derive(Debug)]
pub struct SendReceipt {
    state: ReceiptState,
}

#[derive(Debug)]
enum ReceiptState {
    Waiting(oneshot::Receiver<Result<MessageId, SendError>>),
    Ready(Option<Result<MessageId, SendError>>),
}

impl SendReceipt {
    fn ready(result: Result<MessageId, SendError>) -> Self {
        Self {
            state: ReceiptState::Ready(Some(result)),
        }
    }
}

impl Future for SendReceipt {
    type Output = Result<MessageId, SendError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            // the actor dropped the reply: the send never completed
            ReceiptState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(SendError::Abandoned))),
            ReceiptState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(SendError::Abandoned)))
            }
        }
    }
}

/// Handle to a producer actor bound to one topic.
#[derive(Debug)]
pub struct Producer {
    name: String,
    topic: String,
    batching: bool,
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    /// Spawns the actor. Must be called inside a tokio runtime.
    pub fn spawn(broker: Arc<dyn LogBroker>, topic: &str, config: ProducerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let actor = Actor {
            broker,
            topic: topic.to_string(),
            name: config.name.clone(),
            max_batch_messages: config.max_batch_messages.max(1),
            max_batch_delay: config.max_batch_delay,
            counters: counters.clone(),
            buffer: Vec::new(),
        };
        let task = tokio::spawn(actor.run(rx));
        debug!(
            "Producer {} on '{}' started (batch {} / {:?})",
            config.name, topic, config.max_batch_messages, config.max_batch_delay
        );

        Self {
            name: config.name.clone(),
            topic: topic.to_string(),
            batching: config.is_batching(),
            tx,
            counters,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_batching(&self) -> bool {
        self.batching
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Buffers `message`. The visibility delay, if any, starts now.
    pub fn send(&self, mut message: OutboundMessage) -> SendReceipt {
        if self.is_closed() {
            return SendReceipt::ready(Err(SendError::ProducerClosed(self.name.clone())));
        }
        message.stamp(now_ms());

        let (reply, rx) = oneshot::channel();
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Command::Send { message, reply }).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            return SendReceipt::ready(Err(SendError::ProducerClosed(self.name.clone())));
        }
        SendReceipt {
            state: ReceiptState::Waiting(rx),
        }
    }

    /// Serializes `value` as JSON and sends it. Serialization failures are
    /// reported on the receipt and never reach the broker.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> SendReceipt {
        match OutboundMessage::json(value) {
            Ok(message) => self.send(message),
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                SendReceipt::ready(Err(e))
            }
        }
    }

    /// Buffers every payload; each receipt fails independently.
    pub fn send_all<I>(&self, messages: I) -> Vec<SendReceipt>
    where
        I: IntoIterator<Item = OutboundMessage>,
    {
        messages.into_iter().map(|m| self.send(m)).collect()
    }

    /// Flushes whatever is buffered and waits for the broker's answer.
    pub async fn flush(&self) -> Result<(), SendError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { done })
            .map_err(|_| SendError::ProducerClosed(self.name.clone()))?;
        rx.await
            .map_err(|_| SendError::ProducerClosed(self.name.clone()))
    }

    /// Stops accepting sends and flushes what is buffered, waiting at most
    /// `drain_timeout`. Returns how many sends were abandoned. Closing twice
    /// is a no-op.
    pub async fn close(&self, drain_timeout: Duration) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let (done, rx) = oneshot::channel();
        let abandoned = if self.tx.send(Command::Close { done }).is_err() {
            0
        } else {
            match timeout(drain_timeout, rx).await {
                Ok(Ok(abandoned)) => abandoned,
                _ => {
                    if let Some(task) = &task {
                        task.abort();
                    }
                    self.counters.pending.swap(0, Ordering::SeqCst)
                }
            }
        };

        if let Some(task) = task {
            let _ = task.await;
        }
        if abandoned > 0 {
            warn!(
                "Producer {} closed with {} abandoned sends",
                self.name, abandoned
            );
        } else {
            info!("Producer {} closed", self.name);
        }
        abandoned
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            producer_name: self.name.clone(),
            topic: self.topic.clone(),
            pending: self.counters.pending.load(Ordering::SeqCst),
            sent: self.counters.sent.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
        }
    }
}

struct Actor {
    broker: Arc<dyn LogBroker>,
    topic: String,
    name: String,
    max_batch_messages: usize,
    max_batch_delay: Duration,
    counters: Arc<Counters>,
    buffer: Vec<(OutboundMessage, Reply)>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    _ = sleep_until(at) => {
                        self.flush().await;
                        deadline = None;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match command {
                Some(Command::Send { message, reply }) => {
                    self.buffer.push((message, reply));
                    if self.buffer.len() >= self.max_batch_messages
                        || self.max_batch_delay.is_zero()
                    {
                        self.flush().await;
                        deadline = None;
                    } else if self.buffer.len() == 1 {
                        deadline = Some(Instant::now() + self.max_batch_delay);
                    }
                }
                Some(Command::Flush { done }) => {
                    self.flush().await;
                    deadline = None;
                    let _ = done.send(());
                }
                Some(Command::Close { done }) => {
                    self.flush().await;
                    rx.close();
                    let mut abandoned = 0;
                    while let Ok(command) = rx.try_recv() {
                        if let Command::Send { reply, .. } = command {
                            self.complete(reply, Err(SendError::ProducerClosed(self.name.clone())));
                            abandoned += 1;
                        }
                    }
                    let _ = done.send(abandoned);
                    break;
                }
                None => {
                    // every handle is gone
                    let abandoned = self.buffer.len();
                    for (_, reply) in std::mem::take(&mut self.buffer) {
                        self.complete(reply, Err(SendError::Abandoned));
                    }
                    if abandoned > 0 {
                        warn!("Producer {} dropped with {} buffered sends", self.name, abandoned);
                    }
                    break;
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let (messages, replies): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffer).into_iter().unzip();
        let count = messages.len();

        match self.broker.publish_batch(&self.topic, messages).await {
            Ok(results) => {
                let mut results = results.into_iter();
                for reply in replies {
                    let result = match results.next() {
                        Some(result) => result.map_err(SendError::from),
                        None => Err(SendError::SendRejected("no result for message".into())),
                    };
                    if let Err(e) = &result {
                        warn!("Send on '{}' failed: {}", self.topic, e);
                    }
                    self.complete(reply, result);
                }
                debug!("Producer {} flushed {} messages", self.name, count);
            }
            Err(e) => {
                let err = SendError::from(e);
                warn!(
                    "Producer {} could not flush {} messages: {}",
                    self.name, count, err
                );
                for reply in replies {
                    self.complete(reply, Err(err.clone()));
                }
            }
        }
        self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    fn complete(&self, reply: Reply, result: Result<MessageId, SendError>) {
        match &result {
            Ok(_) => self.counters.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.send_errors.fetch_add(1, Ordering::Relaxed),
        };
        self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        let _ = reply.send(result);
    }
}
