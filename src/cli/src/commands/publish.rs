//! Publish command.
//!
//! Decodes the payload into the record type of its class, validates it the
//! way the handler will, and publishes it with the producer helpers.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use shop_worker::messaging::{
    AnalyticsEvent, EmailPayload, Envelope, InvoicePayload, JobClass, NotificationPayload, Publisher,
};

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct PublishArgs {
    /// Job class: email, invoice, notification or analytics
    class: JobClass,

    /// JSON payload, or @path to read it from a file
    #[arg(short, long)]
    payload: String,

    /// Override the class default retry budget
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Serialize)]
struct Published {
    id: String,
    #[serde(rename = "type")]
    class: JobClass,
    queue: &'static str,
    max_retries: u32,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&Envelope> for Published {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id.clone(),
            class: envelope.class,
            queue: envelope.class.queue_name(),
            max_retries: envelope.max_retries,
            timestamp: envelope.timestamp,
        }
    }
}

/// Read `--payload`: inline JSON, or `@path` for a file.
pub fn read_payload(arg: &str) -> Result<serde_json::Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read payload file {}", path))?
        }
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

/// A payload decoded into its class record and checked before it is sent.
pub enum Record {
    Email(EmailPayload),
    Invoice(InvoicePayload),
    Notification(NotificationPayload),
    Analytics(AnalyticsEvent),
}

impl Record {
    pub fn parse(class: JobClass, value: serde_json::Value) -> Result<Self> {
        let record = match class {
            JobClass::Email => {
                let email: EmailPayload = serde_json::from_value(value).context("Invalid email payload")?;
                email.validate()?;
                Record::Email(email)
            }
            JobClass::Invoice => {
                let invoice: InvoicePayload = serde_json::from_value(value).context("Invalid invoice payload")?;
                invoice.validate()?;
                Record::Invoice(invoice)
            }
            JobClass::Notification => {
                let notification: NotificationPayload =
                    serde_json::from_value(value).context("Invalid notification payload")?;
                notification.validate()?;
                Record::Notification(notification)
            }
            JobClass::Analytics => Record::Analytics(
                serde_json::from_value(value).context("Invalid analytics event")?,
            ),
        };
        Ok(record)
    }

    async fn publish(&self, publisher: &Publisher) -> shop_worker::Result<Envelope> {
        match self {
            Record::Email(email) => publisher.publish_email(email).await,
            Record::Invoice(invoice) => publisher.publish_invoice(invoice).await,
            Record::Notification(notification) => publisher.publish_notification(notification).await,
            Record::Analytics(event) => publisher.publish_analytics(event).await,
        }
    }
}

pub async fn execute(args: PublishArgs, config_path: Option<&str>, format: OutputFormat) -> Result<()> {
    let record = Record::parse(args.class, read_payload(&args.payload)?)?;

    let config = crate::load_config(config_path)?;
    let broker = crate::connect(&config).await?;
    let publisher = Publisher::new(broker.clone()).with_max_retries(args.max_retries.or(config.workers.max_retries));

    let published = record.publish(&publisher).await;
    if let Err(e) = broker.close().await {
        output::print_warning(&format!("Failed to close broker connection: {}", e));
    }
    let envelope = published?;

    match format {
        OutputFormat::Table => {
            output::print_success(&format!("Published {} job {}", envelope.class, envelope.id));
            output::print_detail("Queue", envelope.class.queue_name());
            output::print_detail("Max retries", &envelope.max_retries.to_string());
            Ok(())
        }
        _ => output::print_item(&Published::from(&envelope), format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_payload_inline_and_file() {
        let inline = read_payload(r#"{"to":"a@shop.test"}"#).unwrap();
        assert_eq!(inline["to"], "a@shop.test");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"event_id":"e-1"}}"#).unwrap();
        let from_file = read_payload(&format!("@{}", file.path().display())).unwrap();
        assert_eq!(from_file["event_id"], "e-1");

        assert!(read_payload("not json").is_err());
        assert!(read_payload("@/nonexistent/payload.json").is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_records() {
        let email = serde_json::json!({
            "to": "ada@shop.test",
            "subject": "",
            "template": "welcome",
            "data": {"FirstName": "Ada"}
        });
        assert!(matches!(Record::parse(JobClass::Email, email), Ok(Record::Email(_))));

        let empty_invoice = serde_json::json!({
            "order_id": "o-1",
            "user_email": "ada@shop.test",
            "order_number": "1",
            "total_amount": 0.0,
            "items": []
        });
        assert!(Record::parse(JobClass::Invoice, empty_invoice).is_err());

        let push_without_title = serde_json::json!({"type": "push_notification", "user_id": "u-1"});
        assert!(Record::parse(JobClass::Notification, push_without_title).is_err());
    }
}
