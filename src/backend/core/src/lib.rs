#![allow(clippy::result_large_err)]
//! # Shop Worker
//!
//! Asynchronous job-processing plane of the online shop.
//!
//! ## Architecture
//!
//! - **Messaging**: JSON envelope codec, RabbitMQ and in-memory brokers, manual-ack
//!   consumer with retry and dead-letter routing, producer helpers
//! - **Jobs**: bounded priority queue, per-class worker pools, envelope adapters
//!   and the Retryable / Scheduled / Batch decorators
//! - **Handlers**: email, invoice, notification and analytics contracts with
//!   their default implementations
//! - **Manager**: owns the four class pipelines and the root cancellation signal
//! - **Health**: broker and pool saturation checks
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod jobs;
pub mod manager;
pub mod messaging;
pub mod telemetry;

pub use error::{ErrorDetails, ErrorKind, ErrorSeverity, JobResult, Result, WorkerError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorKind, JobResult, Result, WorkerError};
    pub use crate::handlers::{AnalyticsHandler, EmailHandler, InvoiceHandler, NotificationHandler};
    pub use crate::health::{HealthReport, HealthStatus};
    pub use crate::jobs::{
        build_job, Batch, BoxedJob, HandlerSet, Job, JobContext, PoolConfig, PoolMetrics, Retryable,
        Scheduled, WorkerPool,
    };
    pub use crate::manager::WorkerManager;
    pub use crate::messaging::{
        AnalyticsEvent, Broker, EmailPayload, Envelope, InMemoryBroker, InvoicePayload, JobClass,
        NotificationPayload, Publisher, RabbitMqBroker,
    };
}
