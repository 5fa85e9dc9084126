//! Health check command.
//!
//! Connects to the configured broker and reports its status. Exits non-zero
//! when the broker is not healthy.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use shop_worker::health::{BrokerHealthChecker, CompositeHealthChecker, ComponentHealth, HealthReport};
use shop_worker::messaging::Broker;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include detailed component checks
    #[arg(short, long)]
    detailed: bool,
}

/// Run the broker checker against `broker`.
pub async fn report(broker: Arc<dyn Broker>) -> HealthReport {
    let components = CompositeHealthChecker::new()
        .add_checker(Arc::new(BrokerHealthChecker::new(broker)))
        .check_all()
        .await;
    HealthReport::new("shopctl").with_components(components)
}

pub async fn execute(args: HealthArgs, config_path: Option<&str>, format: OutputFormat) -> Result<()> {
    let config = crate::load_config(config_path)?;

    let health = match crate::connect(&config).await {
        Ok(broker) => {
            let health = report(broker.clone()).await;
            if let Err(e) = broker.close().await {
                output::print_warning(&format!("Failed to close broker connection: {}", e));
            }
            health
        }
        Err(e) => HealthReport::new("shopctl")
            .with_component(ComponentHealth::unhealthy("broker").with_error(format!("{:#}", e))),
    };

    match format {
        OutputFormat::Table => {
            let status = format!("{:?}", health.status).to_lowercase();
            output::print_header("Broker Health");
            output::print_detail("Status", &output::status_label(&status).to_string());
            output::print_detail("Endpoint", &config.broker.redacted_uri());
            output::print_detail("Timestamp", &health.timestamp.to_rfc3339());

            if args.detailed {
                output::print_header("Components");
                for component in &health.components {
                    let label = format!("{:?}", component.status).to_lowercase();
                    output::print_detail(&component.name, &output::status_label(&label).to_string());
                    if let Some(latency) = component.latency_ms {
                        output::print_detail("  latency_ms", &latency.to_string());
                    }
                    if let Some(error) = &component.error {
                        output::print_detail("  error", error);
                    }
                }
            }

            if health.is_healthy() {
                output::print_success("Broker operational");
            }
        }
        _ => output::print_item(&health, format)?,
    }

    if !health.is_healthy() {
        anyhow::bail!("broker is {:?}", health.status);
    }
    Ok(())
}
