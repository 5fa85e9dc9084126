//! Envelope-to-job adapters.
//!
//! An adapter decodes the envelope payload into its class record, validates
//! it, and calls the class handler. Priorities are fixed per class, except
//! email which takes `payload.priority`.

use async_trait::async_trait;
use std::sync::Arc;

use super::job::{BoxedJob, Job, JobContext, MAX_PRIORITY};
use crate::error::JobResult;
use crate::handlers::{AnalyticsHandler, EmailHandler, InvoiceHandler, NotificationHandler};
use crate::messaging::envelope::{Envelope, JobClass};
use crate::messaging::payload::{AnalyticsEvent, EmailPayload, InvoicePayload, NotificationPayload};

pub const INVOICE_PRIORITY: u8 = 5;
pub const NOTIFICATION_PRIORITY: u8 = 3;
pub const ANALYTICS_PRIORITY: u8 = 1;
pub const BATCH_PRIORITY: u8 = 2;

/// The four class handlers.
#[derive(Clone)]
pub struct HandlerSet {
    pub email: Arc<dyn EmailHandler>,
    pub invoice: Arc<dyn InvoiceHandler>,
    pub notification: Arc<dyn NotificationHandler>,
    pub analytics: Arc<dyn AnalyticsHandler>,
}

/// Priority of an envelope's job.
pub fn priority_for(envelope: &Envelope) -> u8 {
    match envelope.class {
        JobClass::Email => envelope
            .payload
            .get("priority")
            .and_then(serde_json::Value::as_i64)
            .map(|p| p.clamp(0, i64::from(MAX_PRIORITY)) as u8)
            .unwrap_or(0),
        JobClass::Invoice => INVOICE_PRIORITY,
        JobClass::Notification => NOTIFICATION_PRIORITY,
        JobClass::Analytics => ANALYTICS_PRIORITY,
    }
}

/// Job running one envelope through its class handler.
pub struct EnvelopeJob {
    envelope: Envelope,
    priority: u8,
    handlers: HandlerSet,
}

impl EnvelopeJob {
    pub fn new(envelope: Envelope, handlers: HandlerSet) -> Self {
        Self {
            priority: priority_for(&envelope),
            envelope,
            handlers,
        }
    }

    async fn dispatch(&self, ctx: &JobContext) -> JobResult {
        match self.envelope.class {
            JobClass::Email => {
                let email: EmailPayload = self.envelope.payload_as()?;
                email.validate()?;
                self.handlers.email.handle(&email, ctx).await
            }
            JobClass::Invoice => {
                let invoice: InvoicePayload = self.envelope.payload_as()?;
                self.handlers.invoice.handle(&invoice, ctx).await
            }
            JobClass::Notification => {
                let notification: NotificationPayload = self.envelope.payload_as()?;
                notification.validate()?;
                self.handlers.notification.handle(&notification, ctx).await
            }
            JobClass::Analytics => {
                let event: AnalyticsEvent = self.envelope.payload_as()?;
                self.handlers.analytics.handle(&event, ctx).await
            }
        }
    }
}

#[async_trait]
impl Job for EnvelopeJob {
    fn id(&self) -> &str {
        &self.envelope.id
    }

    fn name(&self) -> &'static str {
        self.envelope.class.as_str()
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn envelope(&self) -> Option<&Envelope> {
        Some(&self.envelope)
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        self.dispatch(ctx).await.map_err(|e| {
            e.with_envelope(
                &self.envelope.id,
                self.envelope.class.as_str(),
                self.envelope.attempts,
            )
        })
    }
}

/// Wrap `envelope` as a job for its class pool.
pub fn build_job(envelope: Envelope, handlers: &HandlerSet) -> BoxedJob {
    Box::new(EnvelopeJob::new(envelope, handlers.clone()))
}
