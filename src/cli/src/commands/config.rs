//! Configuration inspection commands.
//!
//! Resolves configuration exactly as the worker does (file, then
//! `SHOP_WORKER__*` environment) and prints it with secrets masked.

use anyhow::Result;
use clap::Subcommand;
use shop_worker::config::Config;
use shop_worker::messaging::JobClass;

use crate::output::{self, OutputFormat};

const MASK: &str = "********";

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
}

/// Copy of `config` with passwords replaced.
pub fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    config.broker.password = MASK.to_string();
    if config.smtp.password.is_some() {
        config.smtp.password = Some(MASK.to_string());
    }
    config
}

pub fn execute(cmd: ConfigCommands, config_path: Option<&str>, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = redacted(&crate::load_config(config_path)?);

            match format {
                OutputFormat::Table => {
                    output::print_header("Broker");
                    output::print_detail("URI", &config.broker.redacted_uri());

                    output::print_header("Workers");
                    for class in JobClass::ALL {
                        output::print_detail(
                            class.as_str(),
                            &format!(
                                "{} workers, queue capacity {}",
                                config.workers.workers_for(class),
                                config.workers.queue_capacity_for(class)
                            ),
                        );
                    }
                    let max_retries = match config.workers.max_retries {
                        Some(n) => n.to_string(),
                        None => "class default".to_string(),
                    };
                    output::print_detail("max_retries", &max_retries);
                    output::print_detail("retry_delay_seconds", &config.workers.retry_delay_seconds.to_string());
                    output::print_detail(
                        "shutdown_timeout_secs",
                        &config.workers.shutdown_timeout_secs.to_string(),
                    );

                    output::print_header("SMTP");
                    output::print_detail("Server", &format!("{}:{}", config.smtp.host, config.smtp.port));
                    output::print_detail("From", &config.smtp.from);

                    output::print_header("Environment");
                    output::print_detail("environment", &config.environment);
                }
                _ => output::print_item(&config, format)?,
            }
        }
    }

    Ok(())
}
