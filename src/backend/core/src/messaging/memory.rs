//! In-process broker.
//!
//! Mirrors the RabbitMQ topology the pipeline relies on: named queues with a
//! ready list, per-consumer prefetch, manual acknowledgements, requeue with
//! the redelivered flag set, and dead-lettering into `<queue>_dlq`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{Result, WorkerError};
use crate::messaging::broker::{declared_queues, Acknowledger, Broker, Delivery, DeliveryStream};
use crate::messaging::envelope::{self, dlq_name, Envelope};

/// Lifetime counters of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

#[derive(Debug)]
struct StoredMessage {
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: usize,
    counters: QueueCounters,
    closed: bool,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    fn push(&self, message: StoredMessage) {
        self.state.lock().ready.push_back(message);
        self.notify.notify_waiters();
    }
}

/// Broker kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    closed: AtomicBool,
    unhealthy: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue. Declaring an existing queue is a no-op.
    pub fn declare(&self, queue: &str) {
        self.queues.lock().entry(queue.to_string()).or_default();
    }

    /// Publish raw bytes, bypassing the codec.
    pub fn publish_raw(&self, queue: &str, data: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let target = self.queue(queue)?;
        target.state.lock().counters.published += 1;
        target.push(StoredMessage {
            data,
            redelivered: false,
        });
        Ok(())
    }

    /// Counters of `queue`; zero for an undeclared queue.
    pub fn counters(&self, queue: &str) -> QueueCounters {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.state.lock().counters)
            .unwrap_or_default()
    }

    /// Envelopes currently sitting in the DLQ of `queue`. Undecodable bodies are skipped.
    pub fn dead_letters(&self, queue: &str) -> Vec<Envelope> {
        let Some(dlq) = self.queues.lock().get(&dlq_name(queue)).cloned() else {
            return Vec::new();
        };
        let state = dlq.state.lock();
        state
            .ready
            .iter()
            .filter_map(|message| envelope::decode(&message.data).ok())
            .collect()
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.state.lock().unacked)
            .unwrap_or_default()
    }

    /// Force the health flag, simulating a dropped connection.
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Poll `queue` counters until `predicate` holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, queue: &str, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&QueueCounters) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.counters(queue)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn queue(&self, queue: &str) -> Result<Arc<MemoryQueue>> {
        self.queues
            .lock()
            .get(queue)
            .cloned()
            .ok_or_else(|| WorkerError::transient_broker(format!("queue '{}' is not declared", queue)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::transient_broker("broker connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn provider_name(&self) -> &'static str {
        "in_memory"
    }

    async fn setup(&self) -> Result<()> {
        self.ensure_open()?;
        for queue in declared_queues() {
            self.declare(&queue);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        let data = envelope::encode(envelope)?;
        self.publish_raw(queue, data)
    }

    async fn deliveries(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let source = self.queue(queue)?;
        let dead_letter = self.queues.lock().get(&dlq_name(queue)).cloned();
        let prefetch = usize::from(prefetch.max(1));

        let stream = futures::stream::unfold((source, dead_letter), move |(source, dead_letter)| async move {
            loop {
                let waiter = Arc::clone(&source);
                let notified = waiter.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let next = {
                    let mut state = source.state.lock();
                    if state.closed {
                        return None;
                    }
                    if state.unacked < prefetch {
                        let message = state.ready.pop_front();
                        if message.is_some() {
                            state.unacked += 1;
                            state.counters.delivered += 1;
                        }
                        message
                    } else {
                        None
                    }
                };

                if let Some(message) = next {
                    let acker = MemoryAcker {
                        source: source.clone(),
                        dead_letter: dead_letter.clone(),
                        data: message.data.clone(),
                        settled: AtomicBool::new(false),
                    };
                    let delivery = Delivery::new(message.data, message.redelivered, acker);
                    return Some((Ok(delivery), (source, dead_letter)));
                }

                notified.await;
            }
        });

        Ok(Box::pin(stream))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let target = self.queue(queue)?;
        let depth = target.state.lock().ready.len();
        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.unhealthy.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for queue in self.queues.lock().values() {
            queue.state.lock().closed = true;
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}

struct MemoryAcker {
    source: Arc<MemoryQueue>,
    dead_letter: Option<Arc<MemoryQueue>>,
    data: Vec<u8>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::transient_broker("delivery already settled"));
        }
        let mut state = self.source.state.lock();
        if state.closed {
            return Err(WorkerError::transient_broker("channel closed before settlement"));
        }
        state.unacked = state.unacked.saturating_sub(1);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.source.state.lock().counters.acked += 1;
        self.source.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        if requeue {
            {
                let mut state = self.source.state.lock();
                state.counters.requeued += 1;
                state.ready.push_back(StoredMessage {
                    data: self.data.clone(),
                    redelivered: true,
                });
            }
        } else {
            self.source.state.lock().counters.dead_lettered += 1;
            if let Some(dead_letter) = &self.dead_letter {
                dead_letter.push(StoredMessage {
                    data: self.data.clone(),
                    redelivered: false,
                });
            }
        }
        self.source.notify.notify_waiters();
        Ok(())
    }
}
