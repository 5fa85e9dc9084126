//! Class-specific payload records.
//!
//! These are the typed forms of an envelope's `payload` map. Producers build
//! them and round-trip them through JSON; adapters decode them back before a
//! handler runs, so handlers never see an untyped map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, WorkerError};
use crate::messaging::envelope::Payload;

// ═══════════════════════════════════════════════════════════════════════════════
// Email
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    pub template: String,
    pub data: Payload,
    #[serde(default)]
    pub priority: i64,
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            template: template.into(),
            data: Payload::new(),
            priority: 0,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.to.trim().is_empty() {
            return Err(WorkerError::validation("email recipient `to` is empty"));
        }
        if self.template.trim().is_empty() {
            return Err(WorkerError::validation("email `template` is empty"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invoice
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub total_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePayload {
    pub order_id: String,
    pub user_email: String,
    pub order_number: String,
    pub total_amount: f64,
    pub items: Vec<InvoiceItem>,
}

impl InvoicePayload {
    pub fn validate(&self) -> Result<()> {
        if self.order_id.trim().is_empty() {
            return Err(WorkerError::validation("invoice `order_id` is empty"));
        }
        if self.order_number.trim().is_empty() {
            return Err(WorkerError::validation("invoice `order_number` is empty"));
        }
        if self.user_email.trim().is_empty() {
            return Err(WorkerError::validation("invoice `user_email` is empty"));
        }
        if self.items.is_empty() {
            return Err(WorkerError::validation("invoice has no items"));
        }
        let amounts = self
            .items
            .iter()
            .flat_map(|item| [item.unit_price, item.total_price])
            .chain(std::iter::once(self.total_amount));
        for amount in amounts {
            if !amount.is_finite() || amount < 0.0 {
                return Err(WorkerError::validation(format!(
                    "invoice amount {} is not a non-negative number",
                    amount
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notification
// ═══════════════════════════════════════════════════════════════════════════════

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    PushNotification,
    Sms,
    InApp,
    Webhook,
}

impl NotificationChannel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PushNotification => "push_notification",
            Self::Sms => "sms",
            Self::InApp => "in_app",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification payload: the primary channel in `type`, extra channels in
/// `channels`, and the union of the per-channel fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub channel: Option<NotificationChannel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<NotificationChannel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// A notification resolved for one channel, with every required field present.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Push {
        user_id: String,
        title: String,
        body: String,
        data: Payload,
    },
    Sms {
        phone_number: String,
        message: String,
    },
    InApp {
        user_id: String,
        title: String,
        message: String,
        action_url: Option<String>,
    },
    Webhook {
        url: String,
        method: String,
        headers: HashMap<String, String>,
        body: Option<serde_json::Value>,
    },
}

impl ChannelMessage {
    pub fn channel(&self) -> NotificationChannel {
        match self {
            Self::Push { .. } => NotificationChannel::PushNotification,
            Self::Sms { .. } => NotificationChannel::Sms,
            Self::InApp { .. } => NotificationChannel::InApp,
            Self::Webhook { .. } => NotificationChannel::Webhook,
        }
    }
}

impl NotificationPayload {
    pub fn new(channel: NotificationChannel) -> Self {
        Self {
            channel: Some(channel),
            ..Default::default()
        }
    }

    /// Primary channel followed by the extra channels, without duplicates.
    pub fn all_channels(&self) -> Vec<NotificationChannel> {
        let mut channels = Vec::with_capacity(1 + self.channels.len());
        for channel in self.channel.iter().chain(self.channels.iter()) {
            if !channels.contains(channel) {
                channels.push(*channel);
            }
        }
        channels
    }

    /// Resolve the fields required by `channel`.
    pub fn resolve(&self, channel: NotificationChannel) -> Result<ChannelMessage> {
        match channel {
            NotificationChannel::PushNotification => Ok(ChannelMessage::Push {
                user_id: required(&self.user_id, channel, "user_id")?,
                title: required(&self.title, channel, "title")?,
                body: match &self.body {
                    Some(serde_json::Value::String(body)) if !body.is_empty() => body.clone(),
                    _ => return Err(missing(channel, "body")),
                },
                data: self.data.clone().unwrap_or_default(),
            }),
            NotificationChannel::Sms => Ok(ChannelMessage::Sms {
                phone_number: required(&self.phone_number, channel, "phone_number")?,
                message: required(&self.message, channel, "message")?,
            }),
            NotificationChannel::InApp => Ok(ChannelMessage::InApp {
                user_id: required(&self.user_id, channel, "user_id")?,
                title: required(&self.title, channel, "title")?,
                message: required(&self.message, channel, "message")?,
                action_url: self.action_url.clone(),
            }),
            NotificationChannel::Webhook => Ok(ChannelMessage::Webhook {
                url: required(&self.url, channel, "url")?,
                method: self
                    .method
                    .clone()
                    .unwrap_or_else(|| "POST".to_string())
                    .to_ascii_uppercase(),
                headers: self.headers.clone().unwrap_or_default(),
                body: self.body.clone(),
            }),
        }
    }

    /// The primary channel must exist and carry its required fields.
    pub fn validate(&self) -> Result<ChannelMessage> {
        let channel = self
            .channel
            .ok_or_else(|| WorkerError::validation("notification `type` is missing"))?;
        self.resolve(channel)
    }
}

fn required(value: &Option<String>, channel: NotificationChannel, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(missing(channel, field)),
    }
}

fn missing(channel: NotificationChannel, field: &str) -> WorkerError {
    WorkerError::validation(format!("{} notification requires `{}`", channel, field))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Analytics
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: String,
    pub event_type: String,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AnalyticsEvent {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            event_name: event_name.into(),
            timestamp: Utc::now(),
            properties: Payload::new(),
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
