//! Broker-side messaging: the envelope codec, broker adapters, the consume
//! loop and the producer helpers.
//!
//! ```text
//! producer ──publish──▶ <class>_queue ──deliveries──▶ Consumer ──handler──▶ pool
//!                           │                            │
//!                           └──── nack(requeue=false) ───┴──▶ <class>_queue_dlq
//! ```

pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod payload;
pub mod publisher;
pub mod rabbitmq;

pub use broker::{declared_queues, Acknowledger, Broker, Delivery, DeliveryStream};
pub use consumer::{
    AttemptLedger, Consumer, ConsumerHandle, ConsumerOptions, ConsumerState, Settlement, StopReason,
};
pub use envelope::{decode, encode, Envelope, JobClass, Payload};
pub use memory::{InMemoryBroker, QueueCounters};
pub use payload::{
    AnalyticsEvent, ChannelMessage, EmailPayload, InvoiceItem, InvoicePayload, NotificationChannel,
    NotificationPayload,
};
pub use publisher::Publisher;
pub use rabbitmq::RabbitMqBroker;
