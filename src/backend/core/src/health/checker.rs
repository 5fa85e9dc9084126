//! Health checkers for the broker connection and the worker pools.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::check::{ComponentHealth, HealthStatus};
use crate::jobs::WorkerPool;
use crate::messaging::Broker;

/// Queue fill ratio above which a pool is reported degraded.
pub const QUEUE_SATURATION_THRESHOLD: f64 = 0.8;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Checker Trait
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;

    /// Run [`check`](Self::check) under a timeout, recording its latency.
    async fn check_with_config(&self, config: &HealthCheckConfig) -> ComponentHealth {
        let start = Instant::now();
        match tokio::time::timeout(config.timeout, self.check()).await {
            Ok(health) => health.with_latency(start.elapsed()),
            Err(_) => ComponentHealth::unhealthy(self.name())
                .with_error(format!("health check timed out after {:?}", config.timeout))
                .with_latency(start.elapsed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BrokerHealthChecker {
    broker: Arc<dyn Broker>,
}

impl BrokerHealthChecker {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl HealthChecker for BrokerHealthChecker {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> ComponentHealth {
        let provider = self.broker.provider_name();
        if self.broker.health_check().await {
            ComponentHealth::healthy(self.name())
                .with_message(format!("{} connection open", provider))
                .with_metadata("provider", provider)
        } else {
            ComponentHealth::unhealthy(self.name())
                .with_error(format!("{} connection is not open", provider))
                .with_metadata("provider", provider)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pool Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

/// Degraded once the pool's queue holds more than `threshold × capacity` jobs.
pub struct PoolHealthChecker {
    name: String,
    pool: Arc<WorkerPool>,
    threshold: f64,
}

impl PoolHealthChecker {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            name: format!("pool:{}", pool.name()),
            pool,
            threshold: QUEUE_SATURATION_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Largest queue size still considered healthy.
    pub fn max_healthy_queue(&self) -> usize {
        (self.pool.queue_capacity() as f64 * self.threshold) as usize
    }
}

#[async_trait]
impl HealthChecker for PoolHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> ComponentHealth {
        let metrics = self.pool.metrics();
        let limit = self.max_healthy_queue();

        let health = ComponentHealth::healthy(&self.name)
            .with_metadata("workers", metrics.workers)
            .with_metadata("active_workers", metrics.active_workers)
            .with_metadata("jobs_in_queue", metrics.jobs_in_queue)
            .with_metadata("queue_capacity", metrics.queue_capacity)
            .with_metadata("jobs_processed", metrics.jobs_processed)
            .with_metadata("jobs_failed", metrics.jobs_failed);

        if metrics.jobs_in_queue > limit {
            health
                .with_status(HealthStatus::Degraded)
                .with_message(format!(
                    "{} jobs queued, above {} ({:.0}% of capacity {})",
                    metrics.jobs_in_queue,
                    limit,
                    self.threshold * 100.0,
                    metrics.queue_capacity
                ))
        } else {
            health
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Composite Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs several checkers concurrently.
#[derive(Default)]
pub struct CompositeHealthChecker {
    checkers: Vec<Arc<dyn HealthChecker>>,
    config: HealthCheckConfig,
}

impl CompositeHealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn with_config(mut self, config: HealthCheckConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn check_all(&self) -> Vec<ComponentHealth> {
        let checks = self
            .checkers
            .iter()
            .map(|checker| checker.check_with_config(&self.config));
        futures::future::join_all(checks).await
    }

    pub async fn check_combined(&self) -> HealthStatus {
        self.check_all()
            .await
            .into_iter()
            .fold(HealthStatus::Healthy, |acc, r| acc.combine(r.status))
    }
}
