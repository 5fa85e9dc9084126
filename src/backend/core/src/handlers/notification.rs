//! Notification handler: best-effort fan-out over push, SMS, in-app and webhook.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;

use super::NotificationHandler;
use crate::config::NotificationsConfig;
use crate::error::{ErrorKind, JobResult, Result, WorkerError};
use crate::jobs::JobContext;
use crate::messaging::payload::{ChannelMessage, NotificationPayload};

/// Delivers one resolved channel message.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, message: &ChannelMessage) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-App Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InAppNotification {
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// In-app inbox per user.
#[derive(Debug, Default)]
pub struct InAppStore {
    inbox: DashMap<String, Vec<InAppNotification>>,
}

impl InAppStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, user_id: &str, notification: InAppNotification) {
        self.inbox.entry(user_id.to_string()).or_default().push(notification);
    }

    pub fn notifications_for(&self, user_id: &str) -> Vec<InAppNotification> {
        self.inbox
            .get(user_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Sender
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct PushRequest<'a> {
    user_id: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a crate::messaging::envelope::Payload,
}

#[derive(Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    message: &'a str,
}

/// Default [`ChannelSender`]: push and SMS through HTTP gateways, webhooks
/// directly, in-app into an [`InAppStore`].
pub struct HttpChannelSender {
    client: reqwest::Client,
    push_gateway_url: Option<String>,
    sms_gateway_url: Option<String>,
    in_app: Arc<InAppStore>,
}

impl HttpChannelSender {
    pub fn new(config: &NotificationsConfig, in_app: Arc<InAppStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("shop-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WorkerError::configuration("failed to build HTTP client").with_source(e))?;

        Ok(Self {
            client,
            push_gateway_url: config.push_gateway_url.clone(),
            sms_gateway_url: config.sms_gateway_url.clone(),
            in_app,
        })
    }

    pub fn in_app(&self) -> &Arc<InAppStore> {
        &self.in_app
    }

    async fn post_json<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<()> {
        self.client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn gateway<'a>(url: &'a Option<String>, channel: &str) -> Result<&'a str> {
    url.as_deref()
        .ok_or_else(|| WorkerError::configuration(format!("no {} gateway configured", channel)))
}

fn header_map(headers: &std::collections::HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| WorkerError::validation(format!("invalid webhook header name '{}'", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| WorkerError::validation(format!("invalid value for webhook header '{}'", name)))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl ChannelSender for HttpChannelSender {
    async fn send(&self, message: &ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::Push {
                user_id,
                title,
                body,
                data,
            } => {
                let url = gateway(&self.push_gateway_url, "push")?;
                self.post_json(
                    url,
                    &PushRequest {
                        user_id,
                        title,
                        body,
                        data,
                    },
                )
                .await
            }
            ChannelMessage::Sms {
                phone_number,
                message,
            } => {
                let url = gateway(&self.sms_gateway_url, "sms")?;
                self.post_json(
                    url,
                    &SmsRequest {
                        to: phone_number,
                        message,
                    },
                )
                .await
            }
            ChannelMessage::InApp {
                user_id,
                title,
                message,
                action_url,
            } => {
                self.in_app.push(
                    user_id,
                    InAppNotification {
                        title: title.clone(),
                        message: message.clone(),
                        action_url: action_url.clone(),
                        created_at: Utc::now(),
                    },
                );
                Ok(())
            }
            ChannelMessage::Webhook {
                url,
                method,
                headers,
                body,
            } => {
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|_| WorkerError::validation(format!("invalid webhook method '{}'", method)))?;
                let mut request = self
                    .client
                    .request(method, url.as_str())
                    .headers(header_map(headers)?);
                if let Some(body) = body {
                    request = request.json(body);
                }
                request.send().await?.error_for_status()?;
                Ok(())
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// Default [`NotificationHandler`].
///
/// The primary channel must resolve; every channel is then attempted and
/// the handler fails only when none succeeded.
pub struct FanoutNotificationHandler {
    sender: Arc<dyn ChannelSender>,
}

impl FanoutNotificationHandler {
    pub fn new(sender: Arc<dyn ChannelSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl NotificationHandler for FanoutNotificationHandler {
    async fn handle(&self, notification: &NotificationPayload, ctx: &JobContext) -> JobResult {
        notification.validate()?;

        let channels = notification.all_channels();
        let mut delivered = 0usize;

        for channel in &channels {
            let outcome = match notification.resolve(*channel) {
                Ok(message) => ctx.cancellable(self.sender.send(&message)).await?,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    delivered += 1;
                    tracing::debug!(job_id = %ctx.job_id(), channel = %channel, "Notification delivered");
                }
                Err(e) => tracing::warn!(
                    job_id = %ctx.job_id(),
                    channel = %channel,
                    error_kind = %e.kind(),
                    error = %e,
                    "Notification channel failed"
                ),
            }
        }

        if delivered == 0 {
            return Err(WorkerError::new(
                ErrorKind::TransientHandler,
                format!("all {} notification channels failed", channels.len()),
            )
            .with_context("channels", &channels));
        }

        tracing::info!(
            job_id = %ctx.job_id(),
            delivered,
            attempted = channels.len(),
            "Notification sent"
        );
        Ok(())
    }
}
