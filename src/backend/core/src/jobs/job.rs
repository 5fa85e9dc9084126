//! Job definitions and traits.
//!
//! This module provides the core abstractions for in-process work:
//!
//! - **Job trait**: The interface every unit of work submitted to a pool implements
//! - **JobContext**: Context passed to jobs during execution (attempt, cancellation)
//! - **BackoffStrategy**: Delay calculation for in-process retries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{JobResult, Result, WorkerError};
use crate::messaging::envelope::Envelope;

/// Highest priority value honored by the job queue; larger values are clamped.
pub const MAX_PRIORITY: u8 = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed { delay: Duration },
    /// `base × attempt`: 1×, 2×, 3×, …
    Linear { base: Duration },
    /// `initial × multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Self::Linear { base }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max,
        }
    }

    /// Delay after the failure of `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear { base } => base.saturating_mul(attempt),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
                let secs = (initial.as_secs_f64() * factor).min(max.as_secs_f64());
                Duration::try_from_secs_f64(secs).unwrap_or(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Linear {
            base: Duration::from_secs(1),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to jobs during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: String,
    job_type: &'static str,
    attempt: u32,
    cancellation: CancellationToken,
    started_at: Instant,
}

impl JobContext {
    /// Context for one execution of `job`.
    ///
    /// The attempt number is taken from the job's envelope when it has one.
    pub fn for_job(job: &dyn Job, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id().to_string(),
            job_type: job.name(),
            attempt: job.envelope().map(|e| e.attempts.max(1)).unwrap_or(1),
            cancellation,
            started_at: Instant::now(),
        }
    }

    /// Context not tied to a pool, with its own cancellation signal.
    pub fn detached(job_id: impl Into<String>, job_type: &'static str) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            attempt: 1,
            cancellation: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Context of a job nested inside a decorator, sharing the cancellation signal.
    pub fn child(&self, job: &dyn Job) -> Self {
        Self {
            job_id: job.id().to_string(),
            job_type: job.name(),
            attempt: job.envelope().map(|e| e.attempts.max(1)).unwrap_or(self.attempt),
            cancellation: self.cancellation.clone(),
            started_at: Instant::now(),
        }
    }

    /// Same context with an explicit attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> &'static str {
        self.job_type
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Run `future` unless cancellation fires first.
    pub async fn cancellable<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.cancellation.cancelled() => Err(WorkerError::cancelled()),
            result = future => Ok(result),
        }
    }

    /// Cancellation-aware sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return if self.is_cancelled() {
                Err(WorkerError::cancelled())
            } else {
                Ok(())
            };
        }
        self.cancellable(tokio::time::sleep(duration)).await
    }

    /// Cancellation-aware wait until wallclock reaches `at`.
    ///
    /// Re-checks the wallclock after each timer so a clock that lags the
    /// monotonic timer never releases the wait early.
    pub async fn sleep_until(&self, at: DateTime<Utc>) -> Result<()> {
        loop {
            let remaining = at.signed_duration_since(Utc::now());
            let Ok(remaining) = remaining.to_std() else {
                return Ok(());
            };
            if remaining.is_zero() {
                return Ok(());
            }
            self.sleep(remaining.max(Duration::from_millis(1))).await?;
        }
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_type = self.job_type,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_type = self.job_type,
            attempt = self.attempt,
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job_id,
            job_type = self.job_type,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A single-shot unit of work executed by a pool worker.
#[async_trait]
pub trait Job: Send + Sync {
    /// Job identifier; the envelope id for broker-driven jobs.
    fn id(&self) -> &str;

    /// Type tag used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Scheduling priority; higher runs first, ties run FIFO.
    fn priority(&self) -> u8 {
        0
    }

    /// The envelope this job was built from, if any.
    fn envelope(&self) -> Option<&Envelope> {
        None
    }

    /// Execute the job.
    ///
    /// # Errors
    ///
    /// Return a [`WorkerError`] whose kind most narrowly describes the failure;
    /// the consumer uses it to choose between requeue and dead-lettering.
    async fn execute(&self, ctx: &JobContext) -> JobResult;
}

/// Owned, type-erased job as stored in the queue.
pub type BoxedJob = Box<dyn Job>;

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
