//! In-process job execution for the shop worker.
//!
//! - **Job trait**: single-shot unit of work with a priority and a [`JobContext`]
//! - **Queue**: bounded priority queue, FIFO within a priority level
//! - **Pool**: fixed set of tokio workers per job class
//! - **Adapters**: turn a broker envelope into a job for its class handler
//! - **Decorators**: in-process retry, delayed start, and batching
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   build_job   ┌──────────────┐  submit  ┌──────────────┐
//! │   Envelope   │──────────────▶│ EnvelopeJob  │─────────▶│  WorkerPool  │
//! │ (one class)  │               │ (+decorators)│          │  JobQueue +  │
//! └──────────────┘               └──────────────┘          │  N workers   │
//!                                                          └──────┬───────┘
//!                                                                 │ Completion
//!                                                                 ▼
//!                                                          consumer settles
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use shop_worker::jobs::{build_job, PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::new("email", 4, 16));
//! pool.start(cancellation.clone());
//!
//! let completion = pool.submit(build_job(envelope, &handlers))?;
//! let result = completion.await;
//! ```

pub mod adapters;
pub mod decorators;
pub mod job;
pub mod pool;
pub mod queue;

pub use adapters::{
    build_job, priority_for, EnvelopeJob, HandlerSet, ANALYTICS_PRIORITY, BATCH_PRIORITY,
    INVOICE_PRIORITY, NOTIFICATION_PRIORITY,
};
pub use decorators::{Batch, BatchSummary, Retryable, Scheduled};
pub use job::{BackoffStrategy, BoxedJob, Job, JobContext, MAX_PRIORITY};
pub use pool::{Completion, PoolConfig, PoolMetrics, WorkerPool};
pub use queue::{EnqueueError, JobQueue};
