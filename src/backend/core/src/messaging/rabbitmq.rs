//! RabbitMQ broker adapter on `lapin`.
//!
//! One connection and one channel per process. Queue declaration, publishing
//! and consumer registration share the channel behind an async mutex;
//! acknowledgements go through each delivery's own acker.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::config::BrokerConfig;
use crate::error::{Result, WorkerError};
use crate::messaging::broker::{Acknowledger, Broker, Delivery, DeliveryStream};
use crate::messaging::envelope::{self, dlq_name, Envelope, JobClass, QUEUE_MESSAGE_TTL_MS};

/// RabbitMQ-backed [`Broker`].
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Mutex<Channel>,
    endpoint: String,
    closed: AtomicBool,
}

impl RabbitMqBroker {
    /// Open the connection and its channel.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let endpoint = config.redacted_uri();
        let connection = Connection::connect(
            &config.amqp_uri(),
            ConnectionProperties::default().with_connection_name(config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| {
            WorkerError::transient_broker(format!("failed to connect to {}", endpoint)).with_source(e)
        })?;

        let channel = connection.create_channel().await?;
        tracing::info!(endpoint = %endpoint, "Connected to RabbitMQ");

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            endpoint,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::transient_broker("broker connection is closed"));
        }
        Ok(())
    }
}

/// Arguments of a class queue: message TTL, DLQ routing and the retry hint.
pub fn queue_arguments(class: JobClass) -> FieldTable {
    let queue = class.queue_name();
    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), AMQPValue::LongInt(QUEUE_MESSAGE_TTL_MS));
    args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dlq_name(queue).into()),
    );
    // Informational only: the envelope's max_retries decides.
    args.insert(
        "x-max-retries".into(),
        AMQPValue::LongInt(i32::try_from(class.default_max_retries()).unwrap_or(i32::MAX)),
    );
    args
}

#[async_trait]
impl Broker for RabbitMqBroker {
    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }

    async fn setup(&self) -> Result<()> {
        self.ensure_open()?;
        let channel = self.channel.lock().await;
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        for class in JobClass::ALL {
            let dlq = class.dlq_name();
            channel.queue_declare(&dlq, durable, FieldTable::default()).await?;
            channel
                .queue_declare(class.queue_name(), durable, queue_arguments(class))
                .await?;
            tracing::debug!(queue = class.queue_name(), dlq = %dlq, "Declared queue");
        }

        tracing::info!(queues = JobClass::ALL.len() * 2, "Broker topology declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        let body = envelope::encode(envelope)?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(envelope.id.clone().into());

        let confirm = {
            let channel = self.channel.lock().await;
            channel
                .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
                .await?
        };
        confirm.await?;

        tracing::debug!(queue, id = %envelope.id, r#type = %envelope.class, "Published envelope");
        Ok(())
    }

    async fn deliveries(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let consumer_tag = format!("shop-worker-{}-{}", queue, uuid::Uuid::new_v4().simple());

        let consumer = {
            let channel = self.channel.lock().await;
            // Non-global qos applies to consumers registered after it on this channel.
            channel.basic_qos(prefetch.max(1), BasicQosOptions::default()).await?;
            channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?
        };

        tracing::info!(queue, consumer_tag = %consumer_tag, prefetch, "Registered consumer");

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| Delivery::new(d.data, d.redelivered, LapinAcker { acker: d.acker }))
                .map_err(WorkerError::from)
        });
        Ok(stream.boxed())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        self.ensure_open()?;
        // A passive declare of a missing queue closes its channel; use a scratch one.
        let scratch = self.connection.create_channel().await?;
        let declared = scratch
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        if scratch.status().connected() {
            if let Err(e) = scratch.close(200, "depth check done").await {
                tracing::debug!(queue, error = %e, "Failed to close scratch channel");
            }
        }
        Ok(declared?.message_count())
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel = self.channel.lock().await;
        if channel.status().connected() {
            if let Err(e) = channel.close(200, "worker shutdown").await {
                tracing::warn!(error = %e, "Failed to close channel");
            }
        }
        if self.connection.status().connected() {
            self.connection.close(200, "worker shutdown").await?;
        }

        tracing::info!(endpoint = %self.endpoint, "RabbitMQ connection closed");
        Ok(())
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
