//! Jobs that compose other jobs.
//!
//! - [`Retryable`]: in-process retry loop with a [`BackoffStrategy`]
//! - [`Scheduled`]: holds the inner job until a wallclock instant
//! - [`Batch`]: runs children in order and aggregates their outcomes
//!
//! In-process retry is independent of broker redelivery; the consumer still
//! sees one outcome per execution of the outer job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::adapters::BATCH_PRIORITY;
use super::job::{BackoffStrategy, BoxedJob, Job, JobContext};
use crate::error::{ErrorKind, JobResult, WorkerError};
use crate::messaging::envelope::Envelope;

// ═══════════════════════════════════════════════════════════════════════════════
// Retryable
// ═══════════════════════════════════════════════════════════════════════════════

/// Retries the inner job up to `max_attempts` executions.
pub struct Retryable {
    inner: BoxedJob,
    max_attempts: u32,
    backoff: BackoffStrategy,
}

impl Retryable {
    /// `max_attempts` counts the first execution; `base_delay × attempt` is
    /// slept after each failure.
    pub fn new(inner: BoxedJob, max_attempts: u32, base_delay: std::time::Duration) -> Self {
        Self::with_backoff(inner, max_attempts, BackoffStrategy::linear(base_delay))
    }

    pub fn with_backoff(inner: BoxedJob, max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[async_trait]
impl Job for Retryable {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn priority(&self) -> u8 {
        self.inner.priority()
    }

    fn envelope(&self) -> Option<&Envelope> {
        self.inner.envelope()
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let mut attempt = 1;
        loop {
            let child = ctx.child(self.inner.as_ref()).with_attempt(attempt);
            let error = match self.inner.execute(&child).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !error.is_retryable() || error.kind() == ErrorKind::Cancelled {
                return Err(error);
            }
            if attempt >= self.max_attempts {
                child.log_warn("retry attempts exhausted");
                return Err(error);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::debug!(
                job_id = %child.job_id(),
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying job"
            );
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduled
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs the inner job once wallclock reaches `at`.
pub struct Scheduled {
    inner: BoxedJob,
    at: DateTime<Utc>,
}

impl Scheduled {
    pub fn new(inner: BoxedJob, at: DateTime<Utc>) -> Self {
        Self { inner, at }
    }

    pub fn after(inner: BoxedJob, delay: std::time::Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Self::new(inner, Utc::now() + delay)
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

#[async_trait]
impl Job for Scheduled {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn priority(&self) -> u8 {
        self.inner.priority()
    }

    fn envelope(&self) -> Option<&Envelope> {
        self.inner.envelope()
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        ctx.sleep_until(self.at).await?;
        self.inner.execute(&ctx.child(self.inner.as_ref())).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batch
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated outcome of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub success_count: usize,
    pub error_count: usize,
    pub total: usize,
}

/// Runs its children sequentially in submission order.
pub struct Batch {
    id: String,
    jobs: Vec<BoxedJob>,
}

impl Batch {
    pub fn new(jobs: Vec<BoxedJob>) -> Self {
        Self {
            id: format!("batch_{}", uuid::Uuid::new_v4().simple()),
            jobs,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every child and report the counts.
    ///
    /// Stops early with `Cancelled` when cancellation fires between children.
    pub async fn run(&self, ctx: &JobContext) -> Result<(BatchSummary, bool), WorkerError> {
        let mut summary = BatchSummary {
            total: self.jobs.len(),
            ..Default::default()
        };
        let mut any_retryable = false;

        for job in &self.jobs {
            if ctx.is_cancelled() {
                return Err(WorkerError::cancelled().with_context("completed", summary));
            }
            match job.execute(&ctx.child(job.as_ref())).await {
                Ok(()) => summary.success_count += 1,
                Err(e) => {
                    tracing::warn!(
                        batch_id = %self.id,
                        job_id = %job.id(),
                        job_type = job.name(),
                        error = %e,
                        "Batch child failed"
                    );
                    any_retryable |= e.is_retryable();
                    summary.error_count += 1;
                }
            }
        }

        Ok((summary, any_retryable))
    }
}

#[async_trait]
impl Job for Batch {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &'static str {
        "batch"
    }

    fn priority(&self) -> u8 {
        BATCH_PRIORITY
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let (summary, any_retryable) = self.run(ctx).await?;
        if summary.error_count == 0 {
            return Ok(());
        }

        let kind = if any_retryable {
            ErrorKind::TransientHandler
        } else {
            ErrorKind::ValidationFailed
        };
        Err(WorkerError::new(
            kind,
            format!(
                "batch {}: {} of {} jobs failed",
                self.id, summary.error_count, summary.total
            ),
        )
        .with_context("success_count", summary.success_count)
        .with_context("error_count", summary.error_count)
        .with_context("total", summary.total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    struct Flaky {
        failures: u32,
        kind: ErrorKind,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Job for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(WorkerError::new(self.kind, format!("failure {}", call)))
            } else {
                Ok(())
            }
        }
    }

    fn flaky(failures: u32, kind: ErrorKind) -> (BoxedJob, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let job = Flaky {
            failures,
            kind,
            calls: calls.clone(),
        };
        (Box::new(job), calls)
    }

    fn ctx(job: &dyn Job) -> JobContext {
        JobContext::for_job(job, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_retryable_recovers() {
        let (inner, calls) = flaky(2, ErrorKind::TransientHandler);
        let job = Retryable::new(inner, 3, Duration::from_millis(5));
        job.execute(&ctx(&job)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retryable_returns_last_error() {
        let (inner, calls) = flaky(10, ErrorKind::TransientHandler);
        let job = Retryable::new(inner, 3, Duration::from_millis(1));
        let err = job.execute(&ctx(&job)).await.unwrap_err();
        assert_eq!(err.message(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retryable_skips_validation_errors() {
        let (inner, calls) = flaky(10, ErrorKind::ValidationFailed);
        let job = Retryable::new(inner, 5, Duration::from_millis(1));
        let err = job.execute(&ctx(&job)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_waits() {
        let (inner, calls) = flaky(0, ErrorKind::TransientHandler);
        let job = Scheduled::after(inner, Duration::from_millis(50));
        let at = job.at();

        job.execute(&ctx(&job)).await.unwrap();
        assert!(Utc::now() >= at);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_cancelled_never_runs() {
        let (inner, calls) = flaky(0, ErrorKind::TransientHandler);
        let job = Scheduled::after(inner, Duration::from_secs(60));
        let token = CancellationToken::new();
        let context = JobContext::for_job(&job, token.clone());

        let started = Instant::now();
        token.cancel();
        let err = job.execute(&context).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_batch_summary() {
        let (ok, _) = flaky(0, ErrorKind::TransientHandler);
        let (bad, _) = flaky(1, ErrorKind::ValidationFailed);
        let (ok2, _) = flaky(0, ErrorKind::TransientHandler);
        let batch = Batch::new(vec![ok, bad, ok2]).with_id("batch-1");
        assert_eq!(batch.priority(), 2);

        let (summary, retryable) = batch.run(&ctx(&batch)).await.unwrap();
        assert_eq!(
            summary,
            BatchSummary {
                success_count: 2,
                error_count: 1,
                total: 3
            }
        );
        assert!(!retryable);
    }
}
