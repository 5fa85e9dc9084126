//! Broker abstraction.
//!
//! The pipeline talks to the message broker only through [`Broker`]. The
//! RabbitMQ adapter is the production implementation; the in-memory broker
//! backs tests and local runs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

use crate::error::Result;
use crate::messaging::envelope::{Envelope, JobClass};

/// A lazy, unbounded sequence of deliveries from one queue.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Settlement handle of a delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; `requeue = false` dead-letters the message.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message handed out by the broker, owned by the consumer until settled.
pub struct Delivery {
    data: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, redelivered: bool, acker: impl Acknowledger + 'static) -> Self {
        Self {
            data,
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the broker flagged this message as delivered before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Connection-owning broker adapter.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short provider name for logs and health reports.
    fn provider_name(&self) -> &'static str;

    /// Declare every class queue and its DLQ. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Publish an envelope as a persistent JSON message.
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()>;

    /// Register a manual-ack consumer on `queue`.
    ///
    /// At most `prefetch` deliveries are outstanding at once.
    async fn deliveries(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Ready messages in `queue`.
    async fn queue_depth(&self, queue: &str) -> Result<u32>;

    /// Whether the connection is open.
    async fn health_check(&self) -> bool;

    /// Close the channel, then the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Every queue the pipeline declares: class queues followed by their DLQs.
pub fn declared_queues() -> Vec<String> {
    JobClass::ALL
        .iter()
        .map(|class| class.queue_name().to_string())
        .chain(JobClass::ALL.iter().map(|class| class.dlq_name()))
        .collect()
}
