//! Handler contracts, one per job class, and their default implementations.
//!
//! Handlers receive a decoded, validated payload and report success or a
//! typed [`WorkerError`](crate::error::WorkerError). They never touch
//! deliveries and never enqueue jobs: follow-on work goes out as a new
//! envelope through a [`Publisher`](crate::messaging::Publisher). Every
//! handler must tolerate being re-invoked after a partial failure.

pub mod analytics;
pub mod email;
pub mod invoice;
pub mod notification;

use async_trait::async_trait;

use crate::error::JobResult;
use crate::jobs::JobContext;
use crate::messaging::payload::{AnalyticsEvent, EmailPayload, InvoicePayload, NotificationPayload};

pub use analytics::{AnalyticsCounters, AnalyticsSink, InMemoryAnalyticsSink, SinkAnalyticsHandler};
pub use email::{Mailer, OutgoingEmail, RecordingMailer, SmtpMailer, TemplateEmailHandler, TemplateRegistry};
pub use invoice::{Invoice, InvoiceGenerator, PublishingInvoiceHandler};
pub use notification::{
    ChannelSender, FanoutNotificationHandler, HttpChannelSender, InAppNotification, InAppStore,
};

/// Renders a template and sends it.
#[async_trait]
pub trait EmailHandler: Send + Sync {
    async fn handle(&self, email: &EmailPayload, ctx: &JobContext) -> JobResult;
}

/// Builds the invoice and publishes its email.
#[async_trait]
pub trait InvoiceHandler: Send + Sync {
    async fn handle(&self, invoice: &InvoicePayload, ctx: &JobContext) -> JobResult;
}

/// Fans a notification out to its channels.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: &NotificationPayload, ctx: &JobContext) -> JobResult;
}

/// Validates and stores an analytics event.
#[async_trait]
pub trait AnalyticsHandler: Send + Sync {
    async fn handle(&self, event: &AnalyticsEvent, ctx: &JobContext) -> JobResult;
}
