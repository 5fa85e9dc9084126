//! Prometheus metrics for job executions, delivery settlements and pool gauges.
//!
//! All recording goes through the `metrics` facade, so the helpers are no-ops
//! until [`init_metrics`] installs the Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use shop_worker::telemetry::metrics::{DeliveryMetrics, JobMetrics};
//! use std::time::Duration;
//!
//! JobMetrics::record("email", true, Duration::from_millis(12));
//! DeliveryMetrics::record("email_queue", "ack");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

pub const JOBS_TOTAL: &str = "shop_worker_jobs_total";
pub const JOB_DURATION_SECONDS: &str = "shop_worker_job_duration_seconds";
pub const DELIVERIES_TOTAL: &str = "shop_worker_deliveries_total";
pub const QUEUE_DEPTH: &str = "shop_worker_queue_depth";
pub const ACTIVE_WORKERS: &str = "shop_worker_active_workers";
pub const ERRORS_TOTAL: &str = "shop_worker_errors_total";

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Listen address of the Prometheus scrape endpoint (e.g. "0.0.0.0:9090");
    /// no exporter is installed when unset
    #[serde(default)]
    pub prometheus_endpoint: Option<String>,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_endpoint: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

/// Install the Prometheus exporter when an endpoint is configured.
///
/// Returns whether an exporter was installed. Must run inside a tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<bool> {
    let Some(endpoint) = config.prometheus_endpoint.as_deref() else {
        register_metric_descriptions();
        return Ok(false);
    };

    let address: SocketAddr = endpoint
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid prometheus endpoint '{}': {}", endpoint, e))?;

    let mut builder = PrometheusBuilder::new()
        .with_http_listener(address)
        .add_global_label("service", service_name);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;
    builder.install()?;

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %address,
        "Metrics exporter listening"
    );

    Ok(true)
}

fn register_metric_descriptions() {
    describe_counter!(JOBS_TOTAL, "Job executions by class and outcome");
    describe_histogram!(JOB_DURATION_SECONDS, "Job execution wallclock in seconds");
    describe_counter!(DELIVERIES_TOTAL, "Broker settlements by queue and decision");
    describe_gauge!(QUEUE_DEPTH, "Jobs waiting in the in-memory queue of a class");
    describe_gauge!(ACTIVE_WORKERS, "Workers currently executing a job");
    describe_counter!(ERRORS_TOTAL, "Errors by kind");
}

/// Per-execution job metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record(class: &str, succeeded: bool, duration: Duration) {
        counter!(
            JOBS_TOTAL,
            "class" => class.to_string(),
            "outcome" => if succeeded { "succeeded" } else { "failed" },
        )
        .increment(1);

        histogram!(JOB_DURATION_SECONDS, "class" => class.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Broker settlement counter.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    /// `decision` is one of `ack`, `requeue`, `dead_letter`.
    pub fn record(queue: &str, decision: &'static str) {
        counter!(DELIVERIES_TOTAL, "queue" => queue.to_string(), "decision" => decision)
            .increment(1);
    }
}

/// Pool occupancy gauges, refreshed by the manager's reporter.
pub struct PoolGauges;

impl PoolGauges {
    pub fn set(class: &str, queue_depth: usize, active_workers: usize) {
        gauge!(QUEUE_DEPTH, "class" => class.to_string()).set(queue_depth as f64);
        gauge!(ACTIVE_WORKERS, "class" => class.to_string()).set(active_workers as f64);
    }
}
