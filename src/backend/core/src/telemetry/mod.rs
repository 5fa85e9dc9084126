//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: the `metrics` facade with an optional Prometheus exporter
//!
//! # Example
//!
//! ```rust,no_run
//! use shop_worker::config::Config;
//! use shop_worker::telemetry::init_telemetry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! init_telemetry(&config)?;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, DeliveryMetrics, JobMetrics, MetricsConfig, PoolGauges};

use crate::config::Config;

/// Service name attached to metrics and startup logs.
pub const SERVICE_NAME: &str = "shop-worker";

/// Initialize logging, then metrics. Call once at startup, inside the runtime.
pub fn init_telemetry(config: &Config) -> anyhow::Result<()> {
    init_logging(&config.logging, &config.environment)?;
    let exporter = init_metrics(&config.metrics, SERVICE_NAME)?;

    tracing::info!(
        service = SERVICE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        prometheus = exporter,
        "Telemetry initialized"
    );

    Ok(())
}
