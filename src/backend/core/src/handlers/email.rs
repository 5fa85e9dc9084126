//! Email handler: template rendering and SMTP dispatch.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::EmailHandler;
use crate::config::SmtpConfig;
use crate::error::{JobResult, Result, WorkerError};
use crate::jobs::JobContext;
use crate::messaging::envelope::Payload;
use crate::messaging::payload::EmailPayload;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

// ═══════════════════════════════════════════════════════════════════════════════
// Templates
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Template {
    subject: String,
    body: String,
}

/// Named email templates with `{{.Field}}` / `{{Field}}` placeholders.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut registry = Self {
            templates: HashMap::new(),
        };
        registry.register(
            "welcome",
            "Welcome to the shop, {{.FirstName}}!",
            "<h1>Hello {{.FirstName}}</h1><p>Thanks for joining us. Your account is ready.</p>",
        );
        registry.register(
            "order_confirmation",
            "Order {{.OrderNumber}} confirmed",
            "<p>Hi {{.FirstName}},</p><p>We received order {{.OrderNumber}} totalling {{.TotalAmount}}.</p>",
        );
        registry.register(
            "password_reset",
            "Reset your password",
            "<p>Use this link to reset your password: <a href=\"{{.ResetURL}}\">{{.ResetURL}}</a></p>\
             <p>The link expires in {{.ExpiresIn}}.</p>",
        );
        registry.register(
            "invoice",
            "Invoice {{.InvoiceNumber}}",
            "<p>Invoice {{.InvoiceNumber}} for order {{.OrderNumber}}</p>\
             <pre>{{.Lines}}</pre>\
             <p>Subtotal: {{.Subtotal}}<br>Tax: {{.Tax}}<br>Shipping: {{.Shipping}}<br>\
             <strong>Total: {{.Total}}</strong></p>",
        );
        registry.register(
            "payment_receipt",
            "Payment received for order {{.OrderNumber}}",
            "<p>We received your payment of {{.Amount}} for order {{.OrderNumber}}.</p>",
        );
        registry.register(
            "shipping_update",
            "Order {{.OrderNumber}} is on its way",
            "<p>Your order {{.OrderNumber}} shipped with {{.Carrier}}. Tracking number: {{.TrackingNumber}}.</p>",
        );
        registry
    }
}

impl TemplateRegistry {
    pub fn register(&mut self, name: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) {
        self.templates.insert(
            name.into(),
            Template {
                subject: subject.into(),
                body: body.into(),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Render `(subject, body)` of template `name`.
    pub fn render(&self, name: &str, data: &Payload) -> Result<(String, String)> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| WorkerError::validation(format!("unknown email template '{}'", name)))?;
        Ok((substitute(&template.subject, data), substitute(&template.body, data)))
    }
}

/// Replace `{{.Key}}` and `{{Key}}` with values from `data`; missing keys render empty.
fn substitute(text: &str, data: &Payload) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = rest[start + 2..start + 2 + len].trim();
        let key = key.strip_prefix('.').unwrap_or(key);
        match data.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mailers
// ═══════════════════════════════════════════════════════════════════════════════

/// A rendered message ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// SMTP transport on `lettre`.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from = config.from.parse::<Mailbox>().map_err(|e| {
            WorkerError::configuration(format!("invalid smtp.from address '{}'", config.from)).with_source(e)
        })?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(email.to.parse::<Mailbox>()?)
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())?;

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Keeps sent messages in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failures: Mutex<u32>,
    rejections: Mutex<u32>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a transient error.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    /// Reject the next `count` sends the way a 5xx SMTP reply does.
    pub fn reject_next(&self, count: u32) {
        *self.rejections.lock() = count;
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        {
            let mut rejections = self.rejections.lock();
            if *rejections > 0 {
                *rejections -= 1;
                return Err(WorkerError::smtp(true).with_context("to", email.to.clone()));
            }
        }
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(WorkerError::smtp(false));
            }
        }
        self.sent.lock().push(email.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// Default [`EmailHandler`]: render from the registry, then send through a [`Mailer`].
pub struct TemplateEmailHandler {
    templates: TemplateRegistry,
    mailer: Arc<dyn Mailer>,
}

impl TemplateEmailHandler {
    pub fn new(templates: TemplateRegistry, mailer: Arc<dyn Mailer>) -> Self {
        Self { templates, mailer }
    }

    pub fn render(&self, email: &EmailPayload) -> Result<OutgoingEmail> {
        let (default_subject, html_body) = self.templates.render(&email.template, &email.data)?;
        let subject = if email.subject.trim().is_empty() {
            default_subject
        } else {
            email.subject.clone()
        };
        Ok(OutgoingEmail {
            to: email.to.clone(),
            subject,
            html_body,
        })
    }
}

#[async_trait]
impl EmailHandler for TemplateEmailHandler {
    async fn handle(&self, email: &EmailPayload, ctx: &JobContext) -> JobResult {
        let outgoing = self.render(email)?;
        ctx.cancellable(self.mailer.send(&outgoing)).await??;

        tracing::info!(
            job_id = %ctx.job_id(),
            to = %outgoing.to,
            template = %email.template,
            "Email sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn data(value: serde_json::Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    #[test]
    fn test_substitute_both_placeholder_forms() {
        let data = data(json!({"FirstName": "Ada", "Count": 3}));
        assert_eq!(
            substitute("Hi {{.FirstName}}, {{ Count }} items{{.Missing}}.", &data),
            "Hi Ada, 3 items."
        );
        assert_eq!(substitute("unterminated {{.FirstName", &data), "unterminated {{.FirstName");
    }

    #[test]
    fn test_registry_builtins() {
        let registry = TemplateRegistry::default();
        for name in [
            "welcome",
            "order_confirmation",
            "password_reset",
            "invoice",
            "payment_receipt",
            "shipping_update",
        ] {
            assert!(registry.contains(name), "missing template {}", name);
        }

        let err = registry.render("nope", &Payload::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_render_keeps_explicit_subject() {
        let handler = TemplateEmailHandler::new(TemplateRegistry::default(), Arc::new(RecordingMailer::new()));
        let email = EmailPayload::new("a@b", "Hi", "welcome").with_data("FirstName", "Ada");

        let outgoing = handler.render(&email).unwrap();
        assert_eq!(outgoing.subject, "Hi");
        assert!(outgoing.html_body.contains("Hello Ada"));

        let defaulted = handler.render(&EmailPayload::new("a@b", "", "welcome")).unwrap();
        assert_eq!(defaulted.subject, "Welcome to the shop, !");
    }

    #[tokio::test]
    async fn test_recording_mailer_failures() {
        let mailer = RecordingMailer::new();
        mailer.fail_next(1);
        let email = OutgoingEmail {
            to: "a@b".into(),
            subject: "s".into(),
            html_body: "b".into(),
        };

        let err = mailer.send(&email).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientHandler);
        mailer.send(&email).await.unwrap();
        assert_eq!(mailer.sent(), vec![email]);
    }

    #[test]
    fn test_smtp_mailer_rejects_bad_from() {
        let config = SmtpConfig {
            from: "not an address".into(),
            ..Default::default()
        };
        assert!(SmtpMailer::new(&config).is_err());
    }
}
