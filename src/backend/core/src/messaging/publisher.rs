//! Producer helpers.
//!
//! Stamp a fresh envelope (generated id, current time, zero attempts, the
//! class retry budget) around a class record and publish it to the class queue.

use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::messaging::broker::Broker;
use crate::messaging::envelope::{Envelope, JobClass};
use crate::messaging::payload::{AnalyticsEvent, EmailPayload, InvoicePayload, NotificationPayload};

/// Publishes envelopes through a shared [`Broker`].
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    max_retries_override: Option<u32>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            max_retries_override: None,
        }
    }

    /// Stamp `max_retries` on every new envelope instead of the class default.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries_override = max_retries;
        self
    }

    /// Retry budget stamped on new envelopes of `class`.
    pub fn max_retries_for(&self, class: JobClass) -> u32 {
        self.max_retries_override
            .unwrap_or_else(|| class.default_max_retries())
    }

    /// Publish an already built envelope to its class queue.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        self.broker.publish(envelope.class.queue_name(), envelope).await
    }

    /// Wrap `record` in a new envelope of `class` and publish it. Returns the envelope.
    pub async fn publish_record<T: Serialize + Sync>(&self, class: JobClass, record: &T) -> Result<Envelope> {
        let envelope = Envelope::from_record(class, record, self.max_retries_for(class))?;
        self.publish(&envelope).await?;
        Ok(envelope)
    }

    pub async fn publish_email(&self, email: &EmailPayload) -> Result<Envelope> {
        self.publish_record(JobClass::Email, email).await
    }

    pub async fn publish_invoice(&self, invoice: &InvoicePayload) -> Result<Envelope> {
        self.publish_record(JobClass::Invoice, invoice).await
    }

    pub async fn publish_notification(&self, notification: &NotificationPayload) -> Result<Envelope> {
        self.publish_record(JobClass::Notification, notification).await
    }

    pub async fn publish_analytics(&self, event: &AnalyticsEvent) -> Result<Envelope> {
        self.publish_record(JobClass::Analytics, event).await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("broker", &self.broker.provider_name())
            .field("max_retries_override", &self.max_retries_override)
            .finish()
    }
}
