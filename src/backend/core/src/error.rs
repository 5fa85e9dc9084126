//! Error handling for the job-processing plane.
//!
//! This module provides:
//! - A single error type, [`WorkerError`], carrying a machine-readable [`ErrorKind`]
//! - Kind policies the consumer uses to decide ack, requeue or dead-letter
//! - Structured details (envelope id, class, attempts) for terminal-failure logs
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use shop_worker::error::{WorkerError, Result};
//!
//! fn check(to: &str) -> Result<()> {
//!     if to.is_empty() {
//!         return Err(WorkerError::validation("recipient is empty"));
//!     }
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Aliases
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Result of a single job execution.
pub type JobResult = Result<()>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure taxonomy of the pipeline.
///
/// Handlers report the kind that most narrowly fits; the consumer turns the
/// kind into an ack, a requeue or a dead-letter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Delivery body is not a valid envelope. Never retried.
    MalformedEnvelope,
    /// Payload failed class-schema or business validation. Never retried.
    ValidationFailed,
    /// Publish/consume/ack I/O against the broker.
    TransientBroker,
    /// Side-effect failure inside a handler (SMTP refused, sink unavailable).
    TransientHandler,
    /// The in-memory job queue of a class is saturated.
    QueueFull,
    /// Cooperative shutdown interrupted the operation.
    Cancelled,
    /// Invalid or missing configuration.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable string form used in logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope => "malformed_envelope",
            Self::ValidationFailed => "validation_failed",
            Self::TransientBroker => "transient_broker",
            Self::TransientHandler => "transient_handler",
            Self::QueueFull => "queue_full",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Whether a delivery failing with this kind may be redelivered.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientBroker | Self::TransientHandler | Self::QueueFull | Self::Cancelled
        )
    }

    /// Whether a failure of this kind consumes one unit of the envelope's retry budget.
    ///
    /// Backpressure and shutdown are not executions of the handler.
    pub const fn counts_as_attempt(&self) -> bool {
        !matches!(self, Self::QueueFull | Self::Cancelled)
    }

    /// Whether a failure of this kind routes the envelope to the DLQ regardless of attempts.
    pub const fn dead_letters_immediately(&self) -> bool {
        matches!(self, Self::MalformedEnvelope | Self::ValidationFailed)
    }

    /// Severity used for logging.
    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ValidationFailed | Self::QueueFull | Self::Cancelled => ErrorSeverity::Low,
            Self::TransientHandler | Self::MalformedEnvelope => ErrorSeverity::Medium,
            Self::TransientBroker | Self::Configuration => ErrorSeverity::High,
            Self::Internal => ErrorSeverity::Critical,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes (bad payloads, backpressure, shutdown)
    Low,
    /// Operational issues (handler side effects failing)
    Medium,
    /// System errors (broker I/O, configuration)
    High,
    /// Bugs
    Critical,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Envelope the failure relates to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<String>,

    /// Class tag of the envelope or job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,

    /// Attempt number at the time of failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_envelope(
        mut self,
        envelope_id: impl Into<String>,
        job_type: impl Into<String>,
        attempts: u32,
    ) -> Self {
        self.envelope_id = Some(envelope_id.into());
        self.job_type = Some(job_type.into());
        self.attempts = Some(attempts);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type of the worker crate.
#[derive(Error, Debug)]
pub struct WorkerError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl WorkerError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            kind,
            message: message.into(),
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    pub fn malformed_envelope(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::MalformedEnvelope, message)
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    pub fn transient_broker(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::TransientBroker, message)
    }

    pub fn transient_handler(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::TransientHandler, message)
    }

    /// An SMTP delivery failure. Permanent (5xx) rejections are not retried.
    pub fn smtp(permanent: bool) -> Self {
        if permanent {
            Self::validation("SMTP server rejected the message permanently")
        } else {
            Self::transient_handler("SMTP delivery failed")
        }
    }

    /// The in-memory queue for `class` refused a submit.
    pub fn queue_full(class: impl fmt::Display, capacity: usize) -> Self {
        Self::new(
            ErrorKind::QueueFull,
            format!("{} job queue is full (capacity {})", class, capacity),
        )
        .with_context("capacity", capacity)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled by shutdown")
    }

    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Tag the error with the envelope it relates to.
    pub fn with_envelope(
        mut self,
        envelope_id: impl Into<String>,
        job_type: impl Into<String>,
        attempts: u32,
    ) -> Self {
        self.details = std::mem::take(&mut self.details).with_envelope(envelope_id, job_type, attempts);
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let kind = self.kind.as_str();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_kind = kind,
                    message = %self.message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_kind = kind,
                    message = %self.message,
                    source = ?self.source,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(error_kind = kind, message = %self.message, "Medium severity error");
            }
            ErrorSeverity::Low => {
                tracing::debug!(error_kind = kind, message = %self.message, "Low severity error");
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "shop_worker_errors_total",
            "kind" => self.kind.as_str(),
            "retryable" => if self.is_retryable() { "true" } else { "false" },
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for WorkerError {
    fn from(error: serde_json::Error) -> Self {
        Self::internal("JSON serialization failed").with_source(error)
    }
}

impl From<lapin::Error> for WorkerError {
    fn from(error: lapin::Error) -> Self {
        Self::transient_broker("broker operation failed").with_source(error)
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(error: reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "outbound request timed out"
        } else if error.is_connect() {
            "outbound connection failed"
        } else {
            "outbound request failed"
        };
        Self::transient_handler(message).with_source(error)
    }
}

impl From<lettre::transport::smtp::Error> for WorkerError {
    fn from(error: lettre::transport::smtp::Error) -> Self {
        Self::smtp(error.is_permanent()).with_source(error)
    }
}

impl From<lettre::address::AddressError> for WorkerError {
    fn from(error: lettre::address::AddressError) -> Self {
        Self::validation("invalid email address").with_source(error)
    }
}

impl From<lettre::error::Error> for WorkerError {
    fn from(error: lettre::error::Error) -> Self {
        Self::validation("email message could not be built").with_source(error)
    }
}

impl From<config::ConfigError> for WorkerError {
    fn from(error: config::ConfigError) -> Self {
        let message = match &error {
            config::ConfigError::NotFound(_) => "required configuration not found",
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                "configuration file could not be parsed"
            }
            _ => "invalid configuration",
        };
        Self::configuration(message).with_source(error)
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(error: std::io::Error) -> Self {
        Self::internal("I/O error").with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
