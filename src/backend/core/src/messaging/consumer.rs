//! Consume loop: decode, run the handler, settle.
//!
//! A [`Consumer`] pulls deliveries from one queue and spawns a settle task per
//! delivery, bounded by `max_in_flight`. Each settle task decodes the
//! envelope, bumps its attempt counter, awaits the handler and turns the
//! outcome into an ack, a requeue or a dead-letter.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{JobResult, Result};
use crate::messaging::broker::{Broker, Delivery};
use crate::messaging::envelope::{self, Envelope};
use crate::telemetry::metrics::DeliveryMetrics;

/// Upper bound of the requeue backoff.
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(60);

/// Ledger entries older than the queue message TTL belong to messages that
/// can no longer come back to this queue.
pub const LEDGER_TTL: Duration = Duration::from_millis(envelope::QUEUE_MESSAGE_TTL_MS as u64);

/// How often a running consumer sweeps its ledger.
pub const LEDGER_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

// ═══════════════════════════════════════════════════════════════════════════════
// Settlement Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// What happens to a delivery once its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

impl Settlement {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Decide from the handler outcome and the envelope's current attempt.
    ///
    /// Validation and malformed-envelope failures dead-letter at once;
    /// backpressure and shutdown always requeue; every other failure is
    /// requeued while `attempts <= max_retries`.
    pub fn decide(envelope: &Envelope, result: &JobResult) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(e) if e.kind().dead_letters_immediately() => Self::DeadLetter,
            Err(e) if !e.kind().counts_as_attempt() => Self::Requeue,
            Err(_) if envelope.has_retries_left() => Self::Requeue,
            Err(_) => Self::DeadLetter,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Attempt Ledger
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempts per envelope seen by this process.
///
/// Requeued broker messages keep their original body, so the counter lives
/// here until the envelope is acked or dead-lettered. Entries are keyed by
/// envelope id and producer timestamp: two envelopes sharing an id (a
/// re-published follow-on) count separately. Entries whose message left this
/// process without a terminal decision are dropped by [`sweep`](Self::sweep).
#[derive(Debug, Clone, Default)]
pub struct AttemptLedger {
    attempts: Arc<DashMap<LedgerKey, LedgerEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    id: String,
    timestamp: DateTime<Utc>,
}

impl LedgerKey {
    fn of(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id.clone(),
            timestamp: envelope.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    attempts: u32,
    touched: Instant,
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new delivery of `envelope` and return its attempt number.
    pub fn begin(&self, envelope: &Envelope) -> u32 {
        let mut entry = self.attempts.entry(LedgerKey::of(envelope)).or_insert(LedgerEntry {
            attempts: 0,
            touched: Instant::now(),
        });
        entry.attempts = entry.attempts.max(envelope.attempts) + 1;
        entry.touched = Instant::now();
        entry.attempts
    }

    /// Give back the attempt taken by `begin`. An entry back at zero is removed.
    pub fn rollback(&self, envelope: &Envelope) {
        let key = LedgerKey::of(envelope);
        if let Some(mut entry) = self.attempts.get_mut(&key) {
            entry.attempts = entry.attempts.saturating_sub(1);
        }
        self.attempts.remove_if(&key, |_, entry| entry.attempts == 0);
    }

    /// Forget an envelope that reached a terminal decision.
    pub fn finish(&self, envelope: &Envelope) {
        self.attempts.remove(&LedgerKey::of(envelope));
    }

    /// Drop entries not delivered again within `max_age`. Returns how many were removed.
    ///
    /// Covers requeued messages that another process picked up, that expired
    /// into the DLQ or that were still queued when this process stopped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let before = self.attempts.len();
        self.attempts.retain(|_, entry| entry.touched.elapsed() < max_age);
        before.saturating_sub(self.attempts.len())
    }

    pub fn get(&self, envelope: &Envelope) -> Option<u32> {
        self.attempts
            .get(&LedgerKey::of(envelope))
            .map(|entry| entry.attempts)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consumer State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Consuming,
    Draining,
    Stopped,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Consuming,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Read-only view of a consumer's state.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    queue: String,
    state: Arc<AtomicU8>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Why a consume loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation signal fired.
    Cancelled,
    /// The broker ended the delivery sequence (channel or connection closed).
    ChannelClosed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consumer
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub queue: String,
    /// Deliveries handed to handlers at once; also the broker prefetch
    pub max_in_flight: usize,
    /// Base of the requeue backoff (`base × attempts`, capped); zero disables it
    pub retry_delay: Duration,
    /// Age after which an undelivered ledger entry is dropped
    pub ledger_ttl: Duration,
}

impl ConsumerOptions {
    pub fn new(queue: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            queue: queue.into(),
            max_in_flight: max_in_flight.max(1),
            retry_delay: Duration::ZERO,
            ledger_ttl: LEDGER_TTL,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_ledger_ttl(mut self, ledger_ttl: Duration) -> Self {
        self.ledger_ttl = ledger_ttl;
        self
    }
}

/// Manual-ack consumer of one queue.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    options: ConsumerOptions,
    ledger: AttemptLedger,
    state: Arc<AtomicU8>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, options: ConsumerOptions) -> Self {
        Self {
            broker,
            options,
            ledger: AttemptLedger::new(),
            state: Arc::new(AtomicU8::new(ConsumerState::Idle as u8)),
        }
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            queue: self.options.queue.clone(),
            state: self.state.clone(),
        }
    }

    pub fn ledger(&self) -> &AttemptLedger {
        &self.ledger
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Consume until `cancellation` fires or the broker closes the stream.
    ///
    /// In-flight deliveries are always settled before this returns.
    pub async fn run<H, Fut>(&self, cancellation: CancellationToken, handler: H) -> Result<StopReason>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let queue = self.options.queue.clone();
        let prefetch = u16::try_from(self.options.max_in_flight).unwrap_or(u16::MAX);

        let mut deliveries = match self.broker.deliveries(&queue, prefetch).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConsumerState::Stopped);
                return Err(e);
            }
        };

        self.set_state(ConsumerState::Consuming);
        tracing::info!(queue = %queue, prefetch, "Consumer started");

        let handler = Arc::new(handler);
        let limiter = Arc::new(Semaphore::new(self.options.max_in_flight));
        let tracker = TaskTracker::new();
        let mut sweep = tokio::time::interval(
            LEDGER_SWEEP_INTERVAL
                .min(self.options.ledger_ttl)
                .max(Duration::from_millis(1)),
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            let permit = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break StopReason::Cancelled,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StopReason::ChannelClosed,
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => break StopReason::Cancelled,
                _ = sweep.tick() => {
                    let swept = self.ledger.sweep(self.options.ledger_ttl);
                    if swept > 0 {
                        tracing::debug!(queue = %queue, swept, tracked = self.ledger.len(), "Swept attempt ledger");
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!(queue = %queue, error = %e, "Delivery stream failed");
                    break StopReason::ChannelClosed;
                }
                None => break StopReason::ChannelClosed,
            };

            let settle = Settle {
                queue: queue.clone(),
                ledger: self.ledger.clone(),
                retry_delay: self.options.retry_delay,
                cancellation: cancellation.clone(),
            };
            let handler = handler.clone();
            tracker.spawn(async move {
                settle.process(delivery, handler.as_ref()).await;
                drop(permit);
            });
        };

        self.set_state(ConsumerState::Draining);
        drop(deliveries);
        tracing::info!(
            queue = %queue,
            reason = ?reason,
            in_flight = tracker.len(),
            "Consumer draining"
        );

        tracker.close();
        tracker.wait().await;

        self.set_state(ConsumerState::Stopped);
        tracing::info!(queue = %queue, "Consumer stopped");
        Ok(reason)
    }
}

struct Settle {
    queue: String,
    ledger: AttemptLedger,
    retry_delay: Duration,
    cancellation: CancellationToken,
}

impl Settle {
    async fn process<H, Fut>(&self, delivery: Delivery, handler: &H)
    where
        H: Fn(Envelope) -> Fut,
        Fut: Future<Output = JobResult>,
    {
        let mut envelope = match envelope::decode(delivery.data()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    queue = %self.queue,
                    bytes = delivery.data().len(),
                    error = %e,
                    "Malformed envelope, dead-lettering"
                );
                self.settle(delivery, Settlement::DeadLetter).await;
                return;
            }
        };

        envelope.attempts = self.ledger.begin(&envelope);
        let id = envelope.id.clone();
        let job_type = envelope.class;
        let attempts = envelope.attempts;
        let max_retries = envelope.max_retries;

        let result = handler(envelope.clone()).await;
        let decision = Settlement::decide(&envelope, &result);

        match (&result, decision) {
            (Ok(()), _) => {
                self.ledger.finish(&envelope);
                tracing::debug!(queue = %self.queue, id = %id, r#type = %job_type, attempts, "Envelope handled");
            }
            (Err(e), Settlement::DeadLetter) => {
                self.ledger.finish(&envelope);
                tracing::error!(
                    queue = %self.queue,
                    id = %id,
                    r#type = %job_type,
                    attempts,
                    max_retries,
                    error_kind = %e.kind(),
                    error = %e,
                    "Envelope dead-lettered"
                );
            }
            (Err(e), _) => {
                let counted = e.kind().counts_as_attempt();
                if !counted {
                    self.ledger.rollback(&envelope);
                }
                tracing::warn!(
                    queue = %self.queue,
                    id = %id,
                    r#type = %job_type,
                    attempts,
                    max_retries,
                    error_kind = %e.kind(),
                    error = %e,
                    "Envelope requeued"
                );
                if counted {
                    self.backoff(attempts).await;
                }
            }
        }

        self.settle(delivery, decision).await;
    }

    async fn backoff(&self, attempts: u32) {
        if self.retry_delay.is_zero() {
            return;
        }
        let delay = self.retry_delay.saturating_mul(attempts).min(MAX_REQUEUE_DELAY);
        tokio::select! {
            _ = self.cancellation.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn settle(&self, delivery: Delivery, decision: Settlement) {
        let outcome = match decision {
            Settlement::Ack => delivery.ack().await,
            Settlement::Requeue => delivery.nack(true).await,
            Settlement::DeadLetter => delivery.nack(false).await,
        };

        match outcome {
            Ok(()) => DeliveryMetrics::record(&self.queue, decision.as_str()),
            Err(e) => tracing::error!(
                queue = %self.queue,
                decision = decision.as_str(),
                error = %e,
                "Failed to settle delivery"
            ),
        }
    }
}
