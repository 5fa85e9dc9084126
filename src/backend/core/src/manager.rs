//! Worker Manager - one pool and one consumer driver per job class.
//!
//! The manager owns the root cancellation signal. [`WorkerManager::start`]
//! declares the broker topology, starts the four pools and spawns a consumer
//! driver per class queue plus the metrics reporter. Each delivery is turned
//! into a job with [`build_job`] and submitted to its class pool; a full pool
//! answers `QueueFull`, which the consumer turns into a requeue.
//!
//! [`WorkerManager::stop`] cancels, waits for the drivers (which settle every
//! in-flight delivery), stops the pools and finally closes the broker.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::WorkersConfig;
use crate::error::{ErrorKind, Result, WorkerError};
use crate::health::{
    BrokerHealthChecker, ComponentHealth, CompositeHealthChecker, HealthReport, PoolHealthChecker,
    QUEUE_SATURATION_THRESHOLD,
};
use crate::jobs::{build_job, HandlerSet, PoolConfig, PoolMetrics, WorkerPool};
use crate::messaging::{
    Broker, Consumer, ConsumerOptions, ConsumerState, Envelope, JobClass, Publisher, StopReason,
};
use crate::telemetry::metrics::PoolGauges;
use crate::telemetry::SERVICE_NAME;

/// Pool, consumer and settings of one job class.
struct Lane {
    class: JobClass,
    pool: Arc<WorkerPool>,
    consumer: Arc<Consumer>,
}

impl Lane {
    /// Largest queue size the health check accepts.
    fn saturation_limit(&self) -> usize {
        (self.pool.queue_capacity() as f64 * QUEUE_SATURATION_THRESHOLD) as usize
    }
}

/// Runs the four class pipelines of the worker process.
pub struct WorkerManager {
    config: WorkersConfig,
    broker: Arc<dyn Broker>,
    handlers: HandlerSet,
    lanes: Vec<Lane>,
    cancellation: CancellationToken,
    drivers: Mutex<Vec<(JobClass, JoinHandle<Result<StopReason>>)>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    created_at: Instant,
}

impl WorkerManager {
    /// Build the pools and consumers. Nothing runs until [`start`](Self::start).
    pub fn new(config: WorkersConfig, broker: Arc<dyn Broker>, handlers: HandlerSet) -> Self {
        let lanes = JobClass::ALL
            .iter()
            .map(|&class| {
                let workers = config.workers_for(class);
                let capacity = config.queue_capacity_for(class);
                let pool = Arc::new(WorkerPool::new(PoolConfig::new(class.as_str(), workers, capacity)));

                // Prefetch covers every queued job plus one per busy worker.
                let options = ConsumerOptions::new(class.queue_name(), pool.queue_capacity() + pool.workers())
                    .with_retry_delay(config.retry_delay());
                let consumer = Arc::new(Consumer::new(broker.clone(), options));

                Lane {
                    class,
                    pool,
                    consumer,
                }
            })
            .collect();

        Self {
            config,
            broker,
            handlers,
            lanes,
            cancellation: CancellationToken::new(),
            drivers: Mutex::new(Vec::new()),
            reporter: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Declare queues, start the pools, the consumer drivers and the reporter.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::configuration("worker manager already started"));
        }
        if self.cancellation.is_cancelled() {
            return Err(WorkerError::cancelled());
        }

        self.broker.setup().await?;

        for lane in &self.lanes {
            lane.pool.start(self.cancellation.clone());
        }

        let mut drivers = self.drivers.lock();
        for lane in &self.lanes {
            drivers.push((lane.class, self.spawn_driver(lane)));
        }
        drop(drivers);

        let pools: Vec<_> = self.lanes.iter().map(|lane| lane.pool.clone()).collect();
        *self.reporter.lock() = Some(tokio::spawn(report_metrics(
            pools,
            self.config.metrics_interval(),
            self.cancellation.clone(),
        )));

        tracing::info!(
            provider = self.broker.provider_name(),
            email_workers = self.config.email_workers,
            invoice_workers = self.config.invoice_workers,
            notification_workers = self.config.notification_workers,
            analytics_workers = self.config.analytics_workers,
            "Worker manager started"
        );
        Ok(())
    }

    fn spawn_driver(&self, lane: &Lane) -> JoinHandle<Result<StopReason>> {
        let consumer = lane.consumer.clone();
        let pool = lane.pool.clone();
        let handlers = self.handlers.clone();
        let cancellation = self.cancellation.clone();
        let class = lane.class;

        let handler = move |envelope: Envelope| {
            let pool = pool.clone();
            let job = build_job(envelope, &handlers);
            async move { pool.execute(job).await }
        };

        tokio::spawn(async move {
            let outcome = consumer.run(cancellation.clone(), handler).await;
            match &outcome {
                Ok(StopReason::ChannelClosed) if !cancellation.is_cancelled() => {
                    tracing::error!(class = %class, "Broker closed the delivery stream")
                }
                Ok(reason) => tracing::debug!(class = %class, reason = ?reason, "Consumer driver exited"),
                Err(e) => tracing::error!(class = %class, error = %e, "Consumer driver failed"),
            }
            outcome
        })
    }

    /// Fails once stopping, when the broker is unhealthy, or when any class
    /// queue holds more than 80% of its capacity.
    pub async fn health_check(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(WorkerError::new(ErrorKind::Cancelled, "worker manager is stopping"));
        }
        if !self.broker.health_check().await {
            return Err(WorkerError::transient_broker(format!(
                "{} broker is unhealthy",
                self.broker.provider_name()
            )));
        }
        for lane in &self.lanes {
            let size = lane.pool.queue_size();
            let limit = lane.saturation_limit();
            if size > limit {
                return Err(WorkerError::new(
                    ErrorKind::QueueFull,
                    format!("{} queue is saturated: {} jobs queued, limit {}", lane.class, size, limit),
                ));
            }
        }
        Ok(())
    }

    /// Component report: the broker plus one entry per pool.
    pub async fn health_report(&self) -> HealthReport {
        let composite = self.lanes.iter().fold(
            CompositeHealthChecker::new().add_checker(Arc::new(BrokerHealthChecker::new(self.broker.clone()))),
            |composite, lane| composite.add_checker(Arc::new(PoolHealthChecker::new(lane.pool.clone()))),
        );

        let mut report = HealthReport::new(SERVICE_NAME)
            .with_components(composite.check_all().await)
            .with_uptime(self.created_at.elapsed());

        if self.cancellation.is_cancelled() {
            report = report.with_component(ComponentHealth::unhealthy("manager").with_error("stopping"));
        }
        report
    }

    /// Metrics snapshots of the four pools, in class order.
    pub fn pool_metrics(&self) -> Vec<PoolMetrics> {
        self.lanes.iter().map(|lane| lane.pool.metrics()).collect()
    }

    pub fn pool(&self, class: JobClass) -> Option<&Arc<WorkerPool>> {
        self.lanes.iter().find(|lane| lane.class == class).map(|lane| &lane.pool)
    }

    pub fn consumer_states(&self) -> Vec<(JobClass, ConsumerState)> {
        self.lanes
            .iter()
            .map(|lane| (lane.class, lane.consumer.handle().state()))
            .collect()
    }

    /// Producer helpers bound to this manager's broker and retry override.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.broker.clone()).with_max_retries(self.config.max_retries)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancellation.is_cancelled()
    }

    /// Cancel and wait for every task, then close the broker.
    ///
    /// Returns the first error met; later ones are logged. A second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let started = Instant::now();
        tracing::info!("Worker manager stopping");
        self.cancellation.cancel();

        let mut first_error: Option<WorkerError> = None;
        let mut record = |error: WorkerError| {
            if first_error.is_none() {
                first_error = Some(error);
            } else {
                tracing::error!(error = %error, "Additional error during shutdown");
            }
        };

        let drivers: Vec<_> = self.drivers.lock().drain(..).collect();
        for (class, handle) in drivers {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => record(e),
                Err(e) => record(WorkerError::internal(format!(
                    "consumer driver for {} panicked: {}",
                    class, e
                ))),
            }
        }

        let reporter = self.reporter.lock().take();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                record(WorkerError::internal(format!("metrics reporter panicked: {}", e)));
            }
        }

        for lane in &self.lanes {
            lane.pool.stop().await;
        }

        if let Err(e) = self.broker.close().await {
            record(e);
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            clean = first_error.is_none(),
            "Worker manager stopped"
        );

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("provider", &self.broker.provider_name())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Log the pool snapshots and refresh the gauges every `interval`.
async fn report_metrics(pools: Vec<Arc<WorkerPool>>, interval: Duration, cancellation: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for pool in &pools {
            let metrics = pool.metrics();
            PoolGauges::set(&metrics.name, metrics.jobs_in_queue, metrics.active_workers);
            tracing::info!(
                class = %metrics.name,
                workers = metrics.workers,
                active_workers = metrics.active_workers,
                jobs_in_queue = metrics.jobs_in_queue,
                queue_capacity = metrics.queue_capacity,
                jobs_processed = metrics.jobs_processed,
                jobs_failed = metrics.jobs_failed,
                jobs_rejected = metrics.jobs_rejected,
                average_job_ms = metrics.average_job_time.as_millis() as u64,
                "Pool metrics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::handlers::{AnalyticsHandler, EmailHandler, InvoiceHandler, NotificationHandler};
    use crate::jobs::JobContext;
    use crate::messaging::{
        AnalyticsEvent, EmailPayload, InMemoryBroker, InvoicePayload, NotificationPayload,
    };
    use async_trait::async_trait;

    struct Accept;

    #[async_trait]
    impl EmailHandler for Accept {
        async fn handle(&self, _email: &EmailPayload, _ctx: &JobContext) -> JobResult {
            Ok(())
        }
    }

    #[async_trait]
    impl InvoiceHandler for Accept {
        async fn handle(&self, _invoice: &InvoicePayload, _ctx: &JobContext) -> JobResult {
            Ok(())
        }
    }

    #[async_trait]
    impl NotificationHandler for Accept {
        async fn handle(&self, _n: &NotificationPayload, _ctx: &JobContext) -> JobResult {
            Ok(())
        }
    }

    #[async_trait]
    impl AnalyticsHandler for Accept {
        async fn handle(&self, _event: &AnalyticsEvent, _ctx: &JobContext) -> JobResult {
            Ok(())
        }
    }

    fn manager(broker: Arc<InMemoryBroker>) -> WorkerManager {
        let accept = Arc::new(Accept);
        let handlers = HandlerSet {
            email: accept.clone(),
            invoice: accept.clone(),
            notification: accept.clone(),
            analytics: accept,
        };
        let config = WorkersConfig {
            email_workers: 1,
            invoice_workers: 1,
            notification_workers: 1,
            analytics_workers: 1,
            ..Default::default()
        };
        WorkerManager::new(config, broker, handlers)
    }

    #[tokio::test]
    async fn test_pools_sized_from_config() {
        let manager = manager(Arc::new(InMemoryBroker::new()));
        let capacities: Vec<_> = manager.pool_metrics().iter().map(|m| m.queue_capacity).collect();
        assert_eq!(capacities, vec![50, 30, 40, 20]);
        assert!(manager
            .consumer_states()
            .iter()
            .all(|(_, state)| *state == ConsumerState::Idle));
    }

    #[tokio::test]
    async fn test_start_consume_and_stop() {
        let broker = Arc::new(InMemoryBroker::new());
        let manager = manager(broker.clone());
        manager.start().await.unwrap();
        assert!(manager.start().await.is_err());
        manager.health_check().await.unwrap();

        let event = AnalyticsEvent::new("evt-1", "page", "view");
        manager.publisher().publish_analytics(&event).await.unwrap();

        assert!(
            broker
                .wait_until("analytics_queue", Duration::from_secs(2), |c| c.acked == 1)
                .await
        );

        manager.stop().await.unwrap();
        assert!(manager.stop().await.is_ok());
        assert!(manager
            .consumer_states()
            .iter()
            .all(|(_, state)| *state == ConsumerState::Stopped));
        assert!(!broker.health_check().await);
        assert_eq!(
            manager.health_check().await.unwrap_err().kind(),
            ErrorKind::Cancelled
        );
    }

    #[tokio::test]
    async fn test_health_check_reports_unhealthy_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        let manager = manager(broker.clone());
        manager.start().await.unwrap();

        broker.set_healthy(false);
        let err = manager.health_check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientBroker);

        let report = manager.health_report().await;
        assert!(!report.is_operational());
        assert_eq!(report.components.len(), 5);

        broker.set_healthy(true);
        manager.stop().await.unwrap();
    }
}
