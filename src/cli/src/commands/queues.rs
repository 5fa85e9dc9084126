//! Queue depth command.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use shop_worker::messaging::{Broker, JobClass};
use tabled::Tabled;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct QueuesArgs {
    /// Only show this job class
    #[arg(short = 't', long = "type")]
    class: Option<JobClass>,

    /// Exit with status 1 when any dead-letter queue is not empty
    #[arg(long)]
    fail_on_dead_letters: bool,
}

#[derive(Debug, Tabled, Serialize)]
pub struct QueueRow {
    #[tabled(rename = "Class")]
    pub class: String,
    #[tabled(rename = "Queue")]
    pub queue: String,
    #[tabled(rename = "Ready")]
    pub depth: String,
    #[tabled(rename = "DLQ")]
    pub dlq: String,
    #[tabled(rename = "Dead Letters")]
    pub dead_letters: String,
}

fn depth_cell(depth: &shop_worker::Result<u32>) -> String {
    match depth {
        Ok(n) => n.to_string(),
        Err(_) => "missing".to_string(),
    }
}

/// Depth of each class queue and its DLQ. Missing queues show as `missing`.
pub async fn collect(broker: &dyn Broker, classes: &[JobClass]) -> (Vec<QueueRow>, u32) {
    let mut rows = Vec::with_capacity(classes.len());
    let mut dead_total = 0;

    for class in classes {
        let dlq = class.dlq_name();
        let depth = broker.queue_depth(class.queue_name()).await;
        let dead = broker.queue_depth(&dlq).await;
        if let Ok(n) = dead {
            dead_total += n;
        }
        rows.push(QueueRow {
            class: class.to_string(),
            queue: class.queue_name().to_string(),
            depth: depth_cell(&depth),
            dlq,
            dead_letters: depth_cell(&dead),
        });
    }

    (rows, dead_total)
}

pub async fn execute(args: QueuesArgs, config_path: Option<&str>, format: OutputFormat) -> Result<()> {
    let config = crate::load_config(config_path)?;
    let broker = crate::connect(&config).await?;

    let classes: Vec<JobClass> = match args.class {
        Some(class) => vec![class],
        None => JobClass::ALL.to_vec(),
    };
    let (rows, dead_total) = collect(broker.as_ref(), &classes).await;
    if let Err(e) = broker.close().await {
        output::print_warning(&format!("Failed to close broker connection: {}", e));
    }

    output::print_list(&rows, format)?;

    if dead_total > 0 {
        output::print_warning(&format!("{} message(s) waiting in dead-letter queues", dead_total));
        if args.fail_on_dead_letters {
            anyhow::bail!("dead-letter queues are not empty");
        }
    }
    Ok(())
}
