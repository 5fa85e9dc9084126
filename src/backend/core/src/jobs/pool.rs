//! Worker Pool - `workers` long-lived tokio tasks sharing one bounded job queue.
//!
//! The `WorkerPool` provides:
//! - Non-blocking submission with backpressure (`QueueFull`) and a per-job
//!   completion channel
//! - Priority-aware scheduling through [`JobQueue`]
//! - Pool statistics kept in atomics and exposed as copied snapshots
//! - Drain-then-exit shutdown driven by the root cancellation signal or [`WorkerPool::stop`]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::job::{BoxedJob, JobContext};
use super::queue::{EnqueueError, JobQueue};
use crate::error::{ErrorKind, JobResult, Result, WorkerError};
use crate::telemetry::metrics::JobMetrics;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name for this pool (for logging/metrics); the class tag for manager pools
    pub name: String,
    /// Number of concurrent workers
    pub workers: usize,
    /// Capacity of the in-memory job queue
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }
}

/// Receives the outcome of a submitted job.
pub type Completion = oneshot::Receiver<JobResult>;

struct PendingJob {
    job: BoxedJob,
    completion: oneshot::Sender<JobResult>,
    enqueued_at: Instant,
}

/// Internal statistics tracking.
#[derive(Default)]
struct PoolStats {
    jobs_submitted: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
    total_exec_time_us: AtomicU64,
    total_wait_time_us: AtomicU64,
    active_workers: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

impl PoolStats {
    fn record_start(&self, waited: Duration) {
        self.total_wait_time_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        let current = self.active_workers.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_concurrent.fetch_max(current, Ordering::AcqRel);
    }

    fn record_finish(&self, succeeded: bool, duration: Duration) {
        if succeeded {
            self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_exec_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    /// Pool name
    pub name: String,
    /// Configured worker count
    pub workers: usize,
    /// Capacity of the job queue
    pub queue_capacity: usize,
    /// Jobs accepted by `submit`
    pub jobs_submitted: u64,
    /// Submissions refused because the queue was full
    pub jobs_rejected: u64,
    /// Executions that succeeded
    pub jobs_processed: u64,
    /// Executions that failed
    pub jobs_failed: u64,
    /// Jobs waiting in the queue
    pub jobs_in_queue: usize,
    /// Workers currently executing a job
    pub active_workers: usize,
    /// Highest number of simultaneously executing jobs
    pub peak_concurrent: usize,
    /// Mean execution wallclock over all finished executions
    pub average_job_time: Duration,
    /// Mean time jobs spent queued before a worker picked them up
    pub average_wait_time: Duration,
}

impl PoolMetrics {
    /// Fraction of finished executions that succeeded (1.0 when nothing ran).
    pub fn success_rate(&self) -> f64 {
        let total = self.jobs_processed + self.jobs_failed;
        if total == 0 {
            1.0
        } else {
            self.jobs_processed as f64 / total as f64
        }
    }

    /// Fraction of workers busy.
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            0.0
        } else {
            self.active_workers as f64 / self.workers as f64
        }
    }

    /// Fraction of the queue capacity in use.
    pub fn queue_fill_ratio(&self) -> f64 {
        if self.queue_capacity == 0 {
            0.0
        } else {
            self.jobs_in_queue as f64 / self.queue_capacity as f64
        }
    }
}

/// Fixed set of workers executing jobs from a shared bounded queue.
pub struct WorkerPool {
    config: PoolConfig,
    queue: Arc<JobQueue<PendingJob>>,
    stats: Arc<PoolStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool; no worker runs until [`start`](Self::start).
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig::new(config.name, config.workers, config.queue_capacity);
        tracing::info!(
            pool_name = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Worker pool created"
        );

        Self {
            queue: Arc::new(JobQueue::new(config.queue_capacity)),
            config,
            stats: Arc::new(PoolStats::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.config.queue_capacity
    }

    /// Spawn the workers. Once `cancellation` fires, workers finish the jobs
    /// already queued, close the queue and exit. Calling `start` twice is a no-op.
    pub fn start(&self, cancellation: CancellationToken) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.queue.is_closed() {
            return;
        }

        for worker_id in 0..self.config.workers {
            let worker = Worker {
                id: worker_id,
                pool_name: self.config.name.clone(),
                queue: self.queue.clone(),
                stats: self.stats.clone(),
                cancellation: cancellation.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            pool_name = %self.config.name,
            workers = self.config.workers,
            "Worker pool started"
        );
    }

    /// Queue `job` without waiting.
    ///
    /// Fails with `QueueFull` when the queue is saturated and with `Cancelled`
    /// once the pool is stopping. The returned receiver yields the job's result.
    pub fn submit(&self, job: BoxedJob) -> Result<Completion> {
        let (sender, receiver) = oneshot::channel();
        let priority = job.priority();
        let pending = PendingJob {
            job,
            completion: sender,
            enqueued_at: Instant::now(),
        };

        match self.queue.try_enqueue(pending, priority) {
            Ok(()) => {
                self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(receiver)
            }
            Err(EnqueueError::Full(_)) => {
                self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                Err(WorkerError::queue_full(&self.config.name, self.config.queue_capacity))
            }
            Err(EnqueueError::Closed(_)) => Err(WorkerError::new(
                ErrorKind::Cancelled,
                format!("worker pool '{}' is stopped", self.config.name),
            )),
        }
    }

    /// Submit and wait for the job's result.
    pub async fn execute(&self, job: BoxedJob) -> JobResult {
        let completion = self.submit(job)?;
        completion.await.map_err(|_| {
            WorkerError::new(
                ErrorKind::Cancelled,
                format!("worker pool '{}' dropped the job", self.config.name),
            )
        })?
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn active_workers(&self) -> usize {
        self.stats.active_workers.load(Ordering::Acquire)
    }

    /// Get pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        let stats = &self.stats;
        let jobs_submitted = stats.jobs_submitted.load(Ordering::Relaxed);
        let jobs_processed = stats.jobs_processed.load(Ordering::Relaxed);
        let jobs_failed = stats.jobs_failed.load(Ordering::Relaxed);
        let finished = jobs_processed + jobs_failed;

        let average_job_time = if finished > 0 {
            Duration::from_micros(stats.total_exec_time_us.load(Ordering::Relaxed) / finished)
        } else {
            Duration::ZERO
        };
        let average_wait_time = if finished > 0 {
            Duration::from_micros(stats.total_wait_time_us.load(Ordering::Relaxed) / finished)
        } else {
            Duration::ZERO
        };

        PoolMetrics {
            name: self.config.name.clone(),
            workers: self.config.workers,
            queue_capacity: self.config.queue_capacity,
            jobs_submitted,
            jobs_rejected: stats.jobs_rejected.load(Ordering::Relaxed),
            jobs_processed,
            jobs_failed,
            jobs_in_queue: self.queue.len(),
            active_workers: stats.active_workers.load(Ordering::Acquire),
            peak_concurrent: stats.peak_concurrent.load(Ordering::Acquire),
            average_job_time,
            average_wait_time,
        }
    }

    /// Close the queue and wait for every worker to return.
    ///
    /// Queued jobs still run; no timeout is applied here.
    pub async fn stop(&self) {
        self.queue.close();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(pool_name = %self.config.name, error = %e, "Worker task failed");
            }
        }

        tracing::info!(pool_name = %self.config.name, "Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

struct Worker {
    id: usize,
    pool_name: String,
    queue: Arc<JobQueue<PendingJob>>,
    stats: Arc<PoolStats>,
    cancellation: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(pool_name = %self.pool_name, worker_id = self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                next = self.queue.dequeue() => next,
                _ = self.cancellation.cancelled() => {
                    // Refuse new work; the next dequeue drains what is left.
                    self.queue.close();
                    continue;
                }
            };

            let Some(pending) = next else {
                break;
            };
            self.execute(pending).await;
        }

        tracing::debug!(pool_name = %self.pool_name, worker_id = self.id, "Worker exited");
    }

    async fn execute(&self, pending: PendingJob) {
        let PendingJob {
            job,
            completion,
            enqueued_at,
        } = pending;

        self.stats.record_start(enqueued_at.elapsed());
        let ctx = JobContext::for_job(job.as_ref(), self.cancellation.clone());
        let started = Instant::now();

        let result = job.execute(&ctx).await;

        let duration = started.elapsed();
        self.stats.record_finish(result.is_ok(), duration);
        JobMetrics::record(&self.pool_name, result.is_ok(), duration);

        match &result {
            Ok(()) => tracing::debug!(
                pool_name = %self.pool_name,
                worker_id = self.id,
                job_id = %job.id(),
                job_type = job.name(),
                duration_ms = duration.as_millis() as u64,
                "Job succeeded"
            ),
            Err(e) => tracing::warn!(
                pool_name = %self.pool_name,
                worker_id = self.id,
                job_id = %job.id(),
                job_type = job.name(),
                attempt = ctx.attempt(),
                duration_ms = duration.as_millis() as u64,
                error = %e,
                "Job failed"
            ),
        }

        // The submitter may have given up waiting; the outcome is already counted.
        let _ = completion.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::Job;
    use async_trait::async_trait;

    struct Sleepy {
        id: String,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Job for Sleepy {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(WorkerError::transient_handler("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn sleepy(id: usize, delay_ms: u64, fail: bool) -> BoxedJob {
        Box::new(Sleepy {
            id: format!("job-{}", id),
            delay: Duration::from_millis(delay_ms),
            fail,
        })
    }

    #[test]
    fn test_pool_config_minimums() {
        let config = PoolConfig::new("email", 0, 0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, 1);
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let pool = WorkerPool::new(PoolConfig::new("email", 2, 10));
        pool.start(CancellationToken::new());

        let ok = pool.submit(sleepy(1, 5, false)).unwrap();
        let failed = pool.submit(sleepy(2, 5, true)).unwrap();

        assert!(ok.await.unwrap().is_ok());
        assert_eq!(failed.await.unwrap().unwrap_err().kind(), ErrorKind::TransientHandler);

        let metrics = pool.metrics();
        assert_eq!(metrics.jobs_processed, 1);
        assert_eq!(metrics.jobs_failed, 1);
        assert_eq!(metrics.jobs_submitted, 2);
        assert!(metrics.average_job_time >= Duration::from_millis(5));
        assert_eq!(metrics.success_rate(), 0.5);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_submit_full_is_immediate() {
        let pool = WorkerPool::new(PoolConfig::new("invoice", 1, 1));
        // Not started: nothing drains the queue.
        let _first = pool.submit(sleepy(1, 0, false)).unwrap();

        let started = Instant::now();
        let err = pool.submit(sleepy(2, 0, false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(pool.metrics().jobs_rejected, 1);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let pool = WorkerPool::new(PoolConfig::new("notification", 3, 50));
        pool.start(CancellationToken::new());

        let completions: Vec<_> = (0..12)
            .map(|i| pool.submit(sleepy(i, 20, false)).unwrap())
            .collect();
        for completion in completions {
            completion.await.unwrap().unwrap();
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.jobs_processed, 12);
        assert!(metrics.peak_concurrent <= 3);
        assert_eq!(metrics.active_workers, 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queue_then_rejects() {
        let pool = WorkerPool::new(PoolConfig::new("analytics", 1, 10));
        pool.start(CancellationToken::new());

        let completions: Vec<_> = (0..4)
            .map(|i| pool.submit(sleepy(i, 10, false)).unwrap())
            .collect();
        pool.stop().await;

        for completion in completions {
            assert!(completion.await.unwrap().is_ok());
        }
        let err = pool.submit(sleepy(9, 0, false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_closes_queue_and_workers_exit() {
        let token = CancellationToken::new();
        let pool = WorkerPool::new(PoolConfig::new("email", 2, 10));
        pool.start(token.clone());

        let running = pool.submit(sleepy(1, 50, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(running.await.unwrap().is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.submit(sleepy(2, 0, false)).is_err());

        tokio::time::timeout(Duration::from_secs(1), pool.stop())
            .await
            .unwrap();
    }
}
