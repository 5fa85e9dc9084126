//! Shop Worker - Main entry point
//!
//! Consumes the four class queues until SIGINT/SIGTERM, then stops within the
//! configured deadline. Exit codes: 0 clean, 1 initialization or shutdown
//! failure, 2 shutdown deadline exceeded.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use shop_worker::{
    config::Config,
    handlers::{
        FanoutNotificationHandler, HttpChannelSender, InAppStore, InMemoryAnalyticsSink, Mailer,
        PublishingInvoiceHandler, RecordingMailer, SinkAnalyticsHandler, SmtpMailer,
        TemplateEmailHandler, TemplateRegistry,
    },
    jobs::HandlerSet,
    manager::WorkerManager,
    messaging::{Broker, InMemoryBroker, Publisher, RabbitMqBroker},
    telemetry::init_telemetry,
};

const EXIT_INIT_FAILURE: u8 = 1;
const EXIT_DEADLINE_EXCEEDED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "shop-worker", version, about = "Shop background job worker")]
struct Args {
    /// Configuration file; SHOP_WORKER__* environment variables apply on top
    #[arg(short, long, env = "SHOP_WORKER_CONFIG")]
    config: Option<String>,

    /// Run against the in-process broker and record mail instead of sending it
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (manager, deadline) = match init(&args).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "Initialization failed");
            eprintln!("shop-worker: initialization failed: {:#}", e);
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    shutdown_signal().await;

    match tokio::time::timeout(deadline, manager.stop()).await {
        Ok(Ok(())) => {
            tracing::info!("Worker shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Worker stopped with errors");
            ExitCode::from(EXIT_INIT_FAILURE)
        }
        Err(_) => {
            tracing::error!(deadline_secs = deadline.as_secs(), "Shutdown deadline exceeded");
            ExitCode::from(EXIT_DEADLINE_EXCEEDED)
        }
    }
}

async fn init(args: &Args) -> anyhow::Result<(WorkerManager, Duration)> {
    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    init_telemetry(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        in_memory = args.in_memory,
        "Starting shop worker"
    );

    let (broker, mailer): (Arc<dyn Broker>, Arc<dyn Mailer>) = if args.in_memory {
        tracing::warn!("Using the in-memory broker; outgoing mail is recorded, not sent");
        (Arc::new(InMemoryBroker::new()), Arc::new(RecordingMailer::new()))
    } else {
        let broker = RabbitMqBroker::connect(&config.broker).await?;
        (Arc::new(broker), Arc::new(SmtpMailer::new(&config.smtp)?))
    };

    let handlers = build_handlers(&config, broker.clone(), mailer)?;
    let manager = WorkerManager::new(config.workers.clone(), broker, handlers);
    manager.start().await?;

    Ok((manager, config.workers.shutdown_timeout()))
}

fn build_handlers(config: &Config, broker: Arc<dyn Broker>, mailer: Arc<dyn Mailer>) -> anyhow::Result<HandlerSet> {
    let publisher = Publisher::new(broker).with_max_retries(config.workers.max_retries);
    let sender = HttpChannelSender::new(&config.notifications, Arc::new(InAppStore::new()))?;
    let analytics = Arc::new(InMemoryAnalyticsSink::new());

    Ok(HandlerSet {
        email: Arc::new(TemplateEmailHandler::new(TemplateRegistry::default(), mailer)),
        invoice: Arc::new(PublishingInvoiceHandler::new(publisher)),
        notification: Arc::new(FanoutNotificationHandler::new(Arc::new(sender))),
        analytics: Arc::new(SinkAnalyticsHandler::new(analytics.clone(), analytics)),
    })
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
