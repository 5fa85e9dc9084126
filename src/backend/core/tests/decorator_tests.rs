//! Tests for the Retryable, Scheduled and Batch decorators running on pools.

use async_trait::async_trait;
use chrono::Utc;
use shop_worker::error::{ErrorKind, JobResult, WorkerError};
use shop_worker::jobs::{
    BackoffStrategy, Batch, BoxedJob, Job, JobContext, PoolConfig, Retryable, Scheduled, WorkerPool,
    BATCH_PRIORITY,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Fails with `kind` for the first `failures` executions.
struct Flaky {
    id: String,
    failures: u32,
    kind: ErrorKind,
    calls: Arc<AtomicU32>,
    attempts_seen: Arc<parking_lot::Mutex<Vec<u32>>>,
}

impl Flaky {
    fn boxed(id: &str, failures: u32, kind: ErrorKind) -> (BoxedJob, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let job = Box::new(Self {
            id: id.to_string(),
            failures,
            kind,
            calls: calls.clone(),
            attempts_seen: Default::default(),
        });
        (job, calls)
    }
}

#[async_trait]
impl Job for Flaky {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &'static str {
        "flaky"
    }

    fn priority(&self) -> u8 {
        4
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        self.attempts_seen.lock().push(ctx.attempt());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(WorkerError::new(self.kind, format!("{} failure {}", self.id, call)))
        } else {
            Ok(())
        }
    }
}

/// Records the wallclock of its execution.
struct Stamp {
    ran_at: Arc<parking_lot::Mutex<Option<chrono::DateTime<Utc>>>>,
}

#[async_trait]
impl Job for Stamp {
    fn id(&self) -> &str {
        "stamp"
    }

    fn name(&self) -> &'static str {
        "stamp"
    }

    async fn execute(&self, _ctx: &JobContext) -> JobResult {
        *self.ran_at.lock() = Some(Utc::now());
        Ok(())
    }
}

fn started_pool(name: &str) -> (WorkerPool, CancellationToken) {
    let token = CancellationToken::new();
    let pool = WorkerPool::new(PoolConfig::new(name, 2, 16));
    pool.start(token.clone());
    (pool, token)
}

// ============================================================================
// Retryable
// ============================================================================

#[tokio::test]
async fn test_retryable_counts_one_pool_execution() {
    let (pool, _token) = started_pool("email");
    let (inner, calls) = Flaky::boxed("r1", 2, ErrorKind::TransientHandler);
    let job = Retryable::new(inner, 3, Duration::from_millis(5));
    assert_eq!(job.priority(), 4);

    pool.execute(Box::new(job)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let metrics = pool.metrics();
    assert_eq!(metrics.jobs_processed, 1);
    assert_eq!(metrics.jobs_failed, 0);
    pool.stop().await;
}

#[tokio::test]
async fn test_retryable_passes_attempt_numbers() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let inner = Box::new(Flaky {
        id: "r2".into(),
        failures: 2,
        kind: ErrorKind::TransientBroker,
        calls: calls.clone(),
        attempts_seen: seen.clone(),
    });
    let job = Retryable::with_backoff(inner, 5, BackoffStrategy::fixed(Duration::from_millis(1)));

    job.execute(&JobContext::detached("r2", "flaky")).await.unwrap();
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_retryable_gives_up_after_max_attempts() {
    let (inner, calls) = Flaky::boxed("r3", u32::MAX, ErrorKind::TransientHandler);
    let job = Retryable::new(inner, 2, Duration::from_millis(1));

    let err = job.execute(&JobContext::detached("r3", "flaky")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientHandler);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retryable_wait_observes_cancellation() {
    let (inner, calls) = Flaky::boxed("r4", u32::MAX, ErrorKind::TransientHandler);
    let job = Retryable::new(inner, 10, Duration::from_secs(30));
    let ctx = JobContext::detached("r4", "flaky");

    let cancel = ctx.cancellation().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = job.execute(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ============================================================================
// Scheduled
// ============================================================================

#[tokio::test]
async fn test_scheduled_never_runs_before_its_instant() {
    let (pool, _token) = started_pool("notification");
    let ran_at = Arc::new(parking_lot::Mutex::new(None));
    let at = Utc::now() + chrono::Duration::milliseconds(80);
    let job = Scheduled::new(Box::new(Stamp { ran_at: ran_at.clone() }), at);
    assert_eq!(job.at(), at);

    pool.execute(Box::new(job)).await.unwrap();
    let ran = ran_at.lock().unwrap();
    assert!(ran >= at);
    pool.stop().await;
}

#[tokio::test]
async fn test_scheduled_in_the_past_runs_immediately() {
    let ran_at = Arc::new(parking_lot::Mutex::new(None));
    let job = Scheduled::new(
        Box::new(Stamp { ran_at: ran_at.clone() }),
        Utc::now() - chrono::Duration::hours(1),
    );

    let started = Instant::now();
    job.execute(&JobContext::detached("stamp", "stamp")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(ran_at.lock().is_some());
}

#[tokio::test]
async fn test_scheduled_cancelled_by_pool_shutdown() {
    let (pool, token) = started_pool("analytics");
    let ran_at = Arc::new(parking_lot::Mutex::new(None));
    let job = Scheduled::after(Box::new(Stamp { ran_at: ran_at.clone() }), Duration::from_secs(60));
    let completion = pool.submit(Box::new(job)).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(ran_at.lock().is_none());
    pool.stop().await;
}

// ============================================================================
// Batch
// ============================================================================

#[tokio::test]
async fn test_batch_all_succeed() {
    let (pool, _token) = started_pool("invoice");
    let jobs: Vec<BoxedJob> = (0..4)
        .map(|i| Flaky::boxed(&format!("b{}", i), 0, ErrorKind::TransientHandler).0)
        .collect();
    let batch = Batch::new(jobs).with_id("batch-ok");
    assert_eq!(batch.priority(), BATCH_PRIORITY);
    assert_eq!(batch.len(), 4);

    pool.execute(Box::new(batch)).await.unwrap();
    assert_eq!(pool.metrics().jobs_processed, 1);
    pool.stop().await;
}

#[tokio::test]
async fn test_batch_reports_counts_and_fails() {
    let jobs: Vec<BoxedJob> = vec![
        Flaky::boxed("ok-1", 0, ErrorKind::TransientHandler).0,
        Flaky::boxed("bad", 1, ErrorKind::ValidationFailed).0,
        Flaky::boxed("ok-2", 0, ErrorKind::TransientHandler).0,
    ];
    let batch = Batch::new(jobs).with_id("batch-mixed");
    let ctx = JobContext::detached("batch-mixed", "batch");

    let (summary, retryable) = batch.run(&ctx).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.error_count, 1);
    assert!(!retryable);

    let jobs: Vec<BoxedJob> = vec![
        Flaky::boxed("ok", 0, ErrorKind::TransientHandler).0,
        Flaky::boxed("flaky", 1, ErrorKind::TransientHandler).0,
    ];
    let err = Batch::new(jobs).execute(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientHandler);
    assert_eq!(err.details().context["error_count"], 1);
    assert_eq!(err.details().context["total"], 2);
}

#[tokio::test]
async fn test_batch_of_retryables() {
    let jobs: Vec<BoxedJob> = vec![
        Box::new(Retryable::new(
            Flaky::boxed("a", 1, ErrorKind::TransientHandler).0,
            2,
            Duration::from_millis(1),
        )),
        Box::new(Retryable::new(
            Flaky::boxed("b", 3, ErrorKind::TransientHandler).0,
            2,
            Duration::from_millis(1),
        )),
    ];
    let (summary, retryable) = Batch::new(jobs)
        .run(&JobContext::detached("nested", "batch"))
        .await
        .unwrap();
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 1);
    assert!(retryable);
}
