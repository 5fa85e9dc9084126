//! Configuration management.
//!
//! Every field carries a serde default so an empty environment produces a
//! runnable local configuration. Values are read from `SHOP_WORKER__*`
//! environment variables, e.g. `SHOP_WORKER__BROKER__HOST` or
//! `SHOP_WORKER__WORKERS__EMAIL_WORKERS`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, WorkerError};
use crate::messaging::envelope::JobClass;
use crate::telemetry::logging::LoggingConfig;
use crate::telemetry::metrics::MetricsConfig;

const ENV_PREFIX: &str = "SHOP_WORKER";

/// Main worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Message broker connection
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Pool sizes and retry settings
    #[serde(default)]
    pub workers: WorkersConfig,

    /// SMTP settings used by the email handler
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Notification channel settings
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Deployment environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_broker_username")]
    pub username: String,

    #[serde(default = "default_broker_password")]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Name shown in the broker management UI
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: default_broker_username(),
            password: default_broker_password(),
            vhost: default_vhost(),
            connection_name: default_connection_name(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for the configured broker.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            encode_vhost(&self.vhost)
        )
    }

    /// AMQP URI with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            encode_vhost(&self.vhost)
        )
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("vhost", &self.vhost)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2f")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_email_workers")]
    pub email_workers: usize,

    #[serde(default = "default_invoice_workers")]
    pub invoice_workers: usize,

    #[serde(default = "default_notification_workers")]
    pub notification_workers: usize,

    #[serde(default = "default_analytics_workers")]
    pub analytics_workers: usize,

    /// Overrides the per-class `max_retries` stamped by the producer helpers
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Base of the requeue backoff; 0 disables it
    #[serde(default)]
    pub retry_delay_seconds: u64,

    /// Interval of the pool metrics reporter
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Deadline for a graceful stop before the process exits forcefully
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            email_workers: default_email_workers(),
            invoice_workers: default_invoice_workers(),
            notification_workers: default_notification_workers(),
            analytics_workers: default_analytics_workers(),
            max_retries: None,
            retry_delay_seconds: 0,
            metrics_interval_secs: default_metrics_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl WorkersConfig {
    /// Worker count of a class.
    pub fn workers_for(&self, class: JobClass) -> usize {
        match class {
            JobClass::Email => self.email_workers,
            JobClass::Invoice => self.invoice_workers,
            JobClass::Notification => self.notification_workers,
            JobClass::Analytics => self.analytics_workers,
        }
    }

    /// In-memory queue capacity of a class: `workers × fanout_factor`.
    pub fn queue_capacity_for(&self, class: JobClass) -> usize {
        self.workers_for(class) * class.fanout_factor()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Sender address of outgoing mail
    #[serde(default = "default_smtp_from")]
    pub from: String,

    /// Upgrade the connection with STARTTLS
    #[serde(default)]
    pub starttls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            from: default_smtp_from(),
            starttls: false,
        }
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("from", &self.from)
            .field("starttls", &self.starttls)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Timeout of outbound webhook and gateway requests
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// HTTP gateway accepting push notifications; push fails when unset
    #[serde(default)]
    pub push_gateway_url: Option<String>,

    /// HTTP gateway accepting SMS messages; SMS fails when unset
    #[serde(default)]
    pub sms_gateway_url: Option<String>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_timeout_secs: default_webhook_timeout_secs(),
            push_gateway_url: None,
            sms_gateway_url: None,
        }
    }
}

impl NotificationsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs.max(1))
    }
}

// Default value functions
fn default_environment() -> String { "development".to_string() }
fn default_broker_host() -> String { "localhost".to_string() }
fn default_broker_port() -> u16 { 5672 }
fn default_broker_username() -> String { "guest".to_string() }
fn default_broker_password() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_connection_name() -> String { "shop-worker".to_string() }
fn default_email_workers() -> usize { 5 }
fn default_invoice_workers() -> usize { 3 }
fn default_notification_workers() -> usize { 4 }
fn default_analytics_workers() -> usize { 2 }
fn default_metrics_interval_secs() -> u64 { 30 }
fn default_shutdown_timeout_secs() -> u64 { 30 }
fn default_smtp_host() -> String { "localhost".to_string() }
fn default_smtp_port() -> u16 { 25 }
fn default_smtp_from() -> String { "no-reply@shop.local".to_string() }
fn default_webhook_timeout_secs() -> u64 { 10 }

impl Config {
    /// Load configuration from the environment (and `.env`, when the caller loaded it).
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the manager cannot run.
    pub fn validate(&self) -> Result<()> {
        for class in JobClass::ALL {
            if self.workers.workers_for(class) == 0 {
                return Err(WorkerError::configuration(format!(
                    "workers.{}_workers must be at least 1",
                    class
                )));
            }
        }
        if self.broker.host.trim().is_empty() {
            return Err(WorkerError::configuration("broker.host is empty"));
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}
