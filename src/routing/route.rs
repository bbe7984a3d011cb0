use std::future::{Future, pending};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, warn};

use crate::broker::{Delivery, Message, Properties};
use crate::routing::policy::RetryPolicy;
use crate::routing::sink::Sink;
use crate::routing::transform::{MessageFormat, Transform};
use crate::utils::error::RouteError;

pub const DEAD_LETTER_ROUTE: &str = "x-dead-letter-route";
pub const DEAD_LETTER_ATTEMPTS: &str = "x-dead-letter-attempts";
pub const DEAD_LETTER_ERROR: &str = "x-dead-letter-error";
pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";

/// A message travelling through a route, whatever its source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub key: Option<String>,
    pub properties: Properties,
}

impl Envelope {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn from_message(message: &Message) -> Self {
        Self {
            payload: message.payload().to_vec(),
            key: message.key().map(str::to_string),
            properties: message.properties().clone(),
        }
    }

    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            payload: delivery.body.clone(),
            key: None,
            properties: delivery.headers.clone(),
        }
    }
}

/// Why a message went to the dead-letter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterReason {
    /// The payload could not be decoded; no delivery was attempted.
    Malformed,
    Transform,
    /// Every allowed attempt failed transiently.
    Exhausted,
    /// The sink refused the message outright.
    Rejected,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Transform => "transform",
            Self::Exhausted => "exhausted",
            Self::Rejected => "rejected",
        }
    }
}

/// Result of running one message through a route.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Delivered {
        attempts: u32,
        waits: Vec<Duration>,
    },
    DeadLettered {
        attempts: u32,
        waits: Vec<Duration>,
        reason: DeadLetterReason,
    },
}

impl ProcessOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. } | Self::DeadLettered { attempts, .. } => *attempts,
        }
    }

    /// Backoff waits taken before the final attempt.
    pub fn waits(&self) -> &[Duration] {
        match self {
            Self::Delivered { waits, .. } | Self::DeadLettered { waits, .. } => waits,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// Counters of one route since it started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteCounters {
    pub processed: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    /// Messages that could not even be dead-lettered.
    pub failures: u64,
}

/// deserialize -> transform -> serialize -> deliver, with retries and a
/// dead-letter path.
pub struct Route {
    id: String,
    format: MessageFormat,
    transform: Arc<dyn Transform>,
    sink: Arc<dyn Sink>,
    dead_letter: Arc<dyn Sink>,
    policy: RetryPolicy,
    counters: Counters,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("sink", &self.sink.describe())
            .field("dead_letter", &self.dead_letter.describe())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Route {
    pub fn new(
        id: impl Into<String>,
        format: MessageFormat,
        transform: Arc<dyn Transform>,
        sink: Arc<dyn Sink>,
        dead_letter: Arc<dyn Sink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            format,
            transform,
            sink,
            dead_letter,
            policy,
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one message through the route.
    ///
    /// Decode and transform failures go straight to the dead-letter path
    /// without consuming an attempt. Transient sink failures are retried
    /// with backoff until the policy is exhausted. The only error returned
    /// is `DeadLetterFailed`: the message reached neither the sink nor the
    /// dead-letter path.
    pub async fn process(&self, envelope: &Envelope) -> Result<ProcessOutcome, RouteError> {
        self.process_until(envelope, pending()).await
    }

    /// Like [`Route::process`], but gives up waiting between attempts once
    /// `stop` completes and returns `Interrupted` without dead-lettering.
    pub async fn process_until(
        &self,
        envelope: &Envelope,
        stop: impl Future<Output = ()>,
    ) -> Result<ProcessOutcome, RouteError> {
        tokio::pin!(stop);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let body = match self.format.decode(&envelope.payload) {
            Ok(body) => body,
            Err(e) => {
                return self
                    .dead_letter(envelope, DeadLetterReason::Malformed, 0, Vec::new(), &e)
                    .await;
            }
        };
        let payload = match self
            .transform
            .apply(body)
            .and_then(|body| self.format.encode(&body))
        {
            Ok(payload) => payload,
            Err(e) => {
                return self
                    .dead_letter(envelope, DeadLetterReason::Transform, 0, Vec::new(), &e)
                    .await;
            }
        };
        let outbound = Envelope {
            payload,
            ..envelope.clone()
        };

        let mut waits = Vec::new();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.sink.deliver(&outbound).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return Ok(ProcessOutcome::Delivered { attempts, waits });
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return self
                    .dead_letter(envelope, DeadLetterReason::Rejected, attempts, waits, &err)
                    .await;
            }
            if !self.policy.allows_retry(attempts) {
                return self
                    .dead_letter(envelope, DeadLetterReason::Exhausted, attempts, waits, &err)
                    .await;
            }

            let wait = self.policy.backoff(attempts);
            warn!(
                "Route {}: attempt {}/{} to {} failed, retrying in {:?}: {}",
                self.id,
                attempts,
                self.policy.max_attempts,
                self.sink.describe(),
                wait,
                err
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                biased;
                _ = &mut stop => {
                    warn!("Route {}: stopped while waiting to retry", self.id);
                    return Err(RouteError::Interrupted(attempts));
                }
                _ = tokio::time::sleep(wait) => {}
            }
            waits.push(wait);
        }
    }

    /// Forwards the original message plus failure metadata, exactly once.
    async fn dead_letter(
        &self,
        original: &Envelope,
        reason: DeadLetterReason,
        attempts: u32,
        waits: Vec<Duration>,
        cause: &RouteError,
    ) -> Result<ProcessOutcome, RouteError> {
        let mut properties = original.properties.clone();
        properties.insert(DEAD_LETTER_ROUTE.to_string(), self.id.clone());
        properties.insert(DEAD_LETTER_ATTEMPTS.to_string(), attempts.to_string());
        properties.insert(DEAD_LETTER_ERROR.to_string(), cause.to_string());
        properties.insert(DEAD_LETTER_REASON.to_string(), reason.as_str().to_string());
        let record = Envelope {
            payload: original.payload.clone(),
            key: original.key.clone(),
            properties,
        };

        warn!(
            "Route {}: dead-lettering to {} after {} attempts ({}): {}",
            self.id,
            self.dead_letter.describe(),
            attempts,
            reason.as_str(),
            cause
        );
        if let Err(e) = self.dead_letter.deliver(&record).await {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            error!("Route {}: dead-letter delivery failed: {}", self.id, e);
            return Err(RouteError::DeadLetterFailed(e.to_string()));
        }
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(ProcessOutcome::DeadLettered {
            attempts,
            waits,
            reason,
        })
    }

    pub fn counters(&self) -> RouteCounters {
        RouteCounters {
            processed: self.counters.processed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}
