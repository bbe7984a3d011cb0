//! The `consumer` module provides the subscription consumer.
//!
//! A consumer is attached to one named subscription. It can be driven by
//! hand with `receive` / `acknowledge`, or by `consume(handler)`, which
//! spawns a pull loop: a handler success acknowledges the message, a handler
//! failure leaves it unacknowledged so the broker redelivers it after the
//! ack timeout.
//!
//! States move `Idle -> Running -> Draining -> Stopped`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumerKey, LogBroker, Message, SubscriptionMode};
use crate::utils::error::{BrokerError, HandlerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Processes one message. An error leaves the message unacknowledged.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message.clone()).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerStats {
    pub consumer_name: String,
    pub topic: String,
    pub subscription: String,
    pub mode: SubscriptionMode,
    pub state: ConsumerState,
    pub received: u64,
    pub acknowledged: u64,
    pub handler_failures: u64,
    pub receive_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acknowledged: AtomicU64,
    handler_failures: AtomicU64,
    receive_errors: AtomicU64,
    in_flight: AtomicBool,
}

/// Shared between the handle and its pull loop.
#[derive(Debug)]
struct Shared {
    broker: Arc<dyn LogBroker>,
    key: ConsumerKey,
    poll_timeout: Duration,
    state: Mutex<ConsumerState>,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        self.broker.acknowledge(&self.key, message.id()).await?;
        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A consumer attached to one subscription.
#[derive(Debug)]
pub struct SubscriptionConsumer {
    shared: Arc<Shared>,
    mode: SubscriptionMode,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SubscriptionConsumer {
    /// Attaches to `subscription`, creating it on the broker if needed.
    pub async fn subscribe(
        broker: Arc<dyn LogBroker>,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        ack_timeout: Duration,
        poll_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let key = broker
            .subscribe(topic, subscription, mode, ack_timeout)
            .await?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                broker,
                key,
                poll_timeout,
                state: Mutex::new(ConsumerState::Idle),
                counters: Counters::default(),
            }),
            mode,
            stop_tx,
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.key.consumer
    }

    pub fn topic(&self) -> &str {
        &self.shared.key.topic
    }

    pub fn subscription(&self) -> &str {
        &self.shared.key.subscription
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn state(&self) -> ConsumerState {
        self.shared.state()
    }

    /// Starts the pull loop. Only an idle consumer can start consuming.
    pub fn consume(&self, handler: impl MessageHandler) -> Result<(), BrokerError> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != ConsumerState::Idle {
                return Err(BrokerError::Rejected(format!(
                    "consumer {} is {:?}",
                    self.name(),
                    *state
                )));
            }
            *state = ConsumerState::Running;
        }

        let task = tokio::spawn(run_loop(
            self.shared.clone(),
            Arc::new(handler),
            self.stop_tx.subscribe(),
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        info!(
            "Consumer {} running on {}/{}",
            self.name(),
            self.topic(),
            self.subscription()
        );
        Ok(())
    }

    /// Pulls one message, waiting at most `wait`.
    pub async fn receive(&self, wait: Duration) -> Result<Option<Message>, BrokerError> {
        let message = self.shared.broker.receive(&self.shared.key, wait).await?;
        if message.is_some() {
            self.shared
                .counters
                .received
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(message)
    }

    pub async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        self.shared.acknowledge(message).await
    }

    /// Stops the loop after the in-flight message resolves, waiting at most
    /// `drain_timeout`, then detaches from the subscription. Returns 1 if an
    /// in-flight message had to be abandoned. Stopping twice is a no-op.
    pub async fn stop(&self, drain_timeout: Duration) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        if self.state() == ConsumerState::Running {
            self.shared.set_state(ConsumerState::Draining);
        }
        self.stop_tx.send_replace(true);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut abandoned = 0;
        if let Some(mut task) = task {
            if timeout(drain_timeout, &mut task).await.is_err() {
                task.abort();
                if self.shared.counters.in_flight.load(Ordering::SeqCst) {
                    abandoned = 1;
                }
                warn!(
                    "Consumer {} did not drain within {:?}",
                    self.name(),
                    drain_timeout
                );
            }
        }

        if let Err(e) = self.shared.broker.unsubscribe(&self.shared.key).await {
            error!("Failed to detach consumer {}: {}", self.name(), e);
        }
        self.shared.set_state(ConsumerState::Stopped);
        info!("Consumer {} stopped", self.name());
        abandoned
    }

    pub fn stats(&self) -> ConsumerStats {
        let counters = &self.shared.counters;
        ConsumerStats {
            consumer_name: self.name().to_string(),
            topic: self.topic().to_string(),
            subscription: self.subscription().to_string(),
            mode: self.mode,
            state: self.state(),
            received: counters.received.load(Ordering::Relaxed),
            acknowledged: counters.acknowledged.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            receive_errors: counters.receive_errors.load(Ordering::Relaxed),
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let received = tokio::select! {
            biased;
            _ = stop.changed() => break,
            received = shared.broker.receive(&shared.key, shared.poll_timeout) => received,
        };

        match received {
            Ok(Some(message)) => {
                shared.counters.in_flight.store(true, Ordering::SeqCst);
                shared.counters.received.fetch_add(1, Ordering::Relaxed);
                match handler.handle(&message).await {
                    Ok(()) => {
                        if let Err(e) = shared.acknowledge(&message).await {
                            warn!("Failed to acknowledge {}: {}", message.id(), e);
                        }
                    }
                    Err(e) => {
                        shared
                            .counters
                            .handler_failures
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Handler failed for {}/{}; left for redelivery: {}",
                            message.topic(),
                            message.id(),
                            e
                        );
                    }
                }
                shared.counters.in_flight.store(false, Ordering::SeqCst);
            }
            Ok(None) => {}
            Err(e) => {
                shared
                    .counters
                    .receive_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Receive on {} failed: {}", shared.key.subscription, e);
                // do not spin while the broker is away
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(shared.poll_timeout) => {}
                }
            }
        }
    }
    debug!("Consumer loop {} exited", shared.key.consumer);
}
