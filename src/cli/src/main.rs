//! shopctl - Operator CLI for the shop background job worker.
//!
//! Publishes envelopes through the canonical producer helpers, inspects
//! queue and DLQ depth, checks broker health and prints configuration.

mod commands;
mod output;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, publish, queues};
use output::OutputFormat;
use shop_worker::config::Config;
use shop_worker::messaging::{Broker, RabbitMqBroker};

/// shopctl - Shop Worker operator CLI
#[derive(Parser)]
#[command(
    name = "shopctl",
    version,
    about = "Shop Worker operator CLI",
    long_about = "Publish jobs, inspect queues and check the health of the shop job broker.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file; SHOP_WORKER__* environment variables apply on top
    #[arg(short, long, global = true, env = "SHOP_WORKER_CONFIG")]
    config: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a job envelope
    Publish(publish::PublishArgs),

    /// Show queue and dead-letter queue depth
    Queues(queues::QueuesArgs),

    /// Check broker health
    Health(health::HealthArgs),

    /// Configuration inspection
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

/// Load configuration the same way the worker does.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    Ok(match path {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    })
}

/// Connect to the configured RabbitMQ broker.
pub async fn connect(config: &Config) -> Result<Arc<dyn Broker>> {
    let broker = RabbitMqBroker::connect(&config.broker).await?;
    Ok(Arc::new(broker))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli.output;
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Publish(args) => publish::execute(args, config_path, format).await,
        Commands::Queues(args) => queues::execute(args, config_path, format).await,
        Commands::Health(args) => health::execute(args, config_path, format).await,
        Commands::Config(cmd) => config::execute(cmd, config_path, format),
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
