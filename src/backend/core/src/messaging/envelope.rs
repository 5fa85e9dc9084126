//! Wire envelope and its JSON codec.
//!
//! Every message on a class queue is an [`Envelope`] encoded as UTF-8 JSON.
//! The payload map is kept untyped here; the job adapters decode it into the
//! class-specific record before any handler sees it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, WorkerError};

/// Per-message TTL applied to every declared queue.
pub const QUEUE_MESSAGE_TTL_MS: i32 = 3_600_000;

/// Free-form payload map.
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Class
// ═══════════════════════════════════════════════════════════════════════════════

/// Class tag of an envelope. Each class owns a queue, a DLQ, and a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    Email,
    Invoice,
    Notification,
    Analytics,
}

impl JobClass {
    pub const ALL: [JobClass; 4] = [
        JobClass::Email,
        JobClass::Invoice,
        JobClass::Notification,
        JobClass::Analytics,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Invoice => "invoice",
            Self::Notification => "notification",
            Self::Analytics => "analytics",
        }
    }

    /// Broker queue carrying this class.
    pub const fn queue_name(&self) -> &'static str {
        match self {
            Self::Email => "email_queue",
            Self::Invoice => "invoice_queue",
            Self::Notification => "notification_queue",
            Self::Analytics => "analytics_queue",
        }
    }

    /// Dead-letter queue paired with [`queue_name`](Self::queue_name).
    pub fn dlq_name(&self) -> String {
        dlq_name(self.queue_name())
    }

    /// In-memory queue capacity per worker.
    pub const fn fanout_factor(&self) -> usize {
        match self {
            Self::Email => 50,
            Self::Invoice => 30,
            Self::Notification => 40,
            Self::Analytics => 20,
        }
    }

    /// `max_retries` the producer helpers stamp on new envelopes.
    pub const fn default_max_retries(&self) -> u32 {
        match self {
            Self::Email | Self::Invoice | Self::Notification => 3,
            Self::Analytics => 1,
        }
    }

    pub fn from_queue_name(queue: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.queue_name() == queue)
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "invoice" => Ok(Self::Invoice),
            "notification" => Ok(Self::Notification),
            "analytics" => Ok(Self::Analytics),
            other => Err(WorkerError::validation(format!("unknown job class '{}'", other))),
        }
    }
}

/// Name of the dead-letter queue for `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{}_dlq", queue)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// The wire-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Producer-assigned unique id
    pub id: String,

    /// Class tag
    #[serde(rename = "type")]
    pub class: JobClass,

    /// Class-specific payload
    pub payload: Payload,

    /// Producer-side creation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Number of deliveries handled so far; 0 on first publish
    #[serde(default)]
    pub attempts: u32,

    /// Redeliveries allowed after the first failure
    #[serde(default)]
    pub max_retries: u32,
}

impl Envelope {
    /// Build a fresh envelope with a generated id, the current time and zero attempts.
    pub fn new(class: JobClass, payload: Payload, max_retries: u32) -> Self {
        Self {
            id: next_message_id(),
            class,
            payload,
            timestamp: Utc::now(),
            attempts: 0,
            max_retries,
        }
    }

    /// Build an envelope from a class-specific record by round-tripping it through JSON.
    pub fn from_record<T: Serialize>(class: JobClass, record: &T, max_retries: u32) -> Result<Self> {
        match serde_json::to_value(record)? {
            serde_json::Value::Object(payload) => Ok(Self::new(class, payload, max_retries)),
            other => Err(WorkerError::validation(format!(
                "{} payload must be a JSON object, got {}",
                class,
                json_type_name(&other)
            ))),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Decode the payload into a class-specific record.
    ///
    /// A schema mismatch is a `ValidationFailed` error.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone())).map_err(|e| {
            WorkerError::validation(format!("invalid {} payload: {}", self.class, e))
                .with_envelope(&self.id, self.class.as_str(), self.attempts)
        })
    }

    /// Whether another delivery is allowed after a failure at the current attempt.
    pub fn has_retries_left(&self) -> bool {
        self.attempts <= self.max_retries
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Codec
// ═══════════════════════════════════════════════════════════════════════════════

/// Serialize an envelope to canonical UTF-8 JSON.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|e| WorkerError::internal("failed to encode envelope").with_source(e))
}

/// Deserialize an envelope; any failure is `MalformedEnvelope`.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| WorkerError::malformed_envelope(format!("undecodable envelope: {}", e)))?;

    if envelope.id.trim().is_empty() {
        return Err(WorkerError::malformed_envelope("envelope id is empty"));
    }

    Ok(envelope)
}

static LAST_MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a process-wide monotonic message id (`msg_<nanos>`).
pub fn next_message_id() -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
    let previous = LAST_MESSAGE_SEQ
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    format!("msg_{}", now.max(previous + 1))
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_class_topology() {
        assert_eq!(JobClass::Email.queue_name(), "email_queue");
        assert_eq!(JobClass::Analytics.dlq_name(), "analytics_queue_dlq");
        assert_eq!(JobClass::Invoice.fanout_factor(), 30);
        assert_eq!(JobClass::Analytics.default_max_retries(), 1);
        assert_eq!(
            JobClass::from_queue_name("notification_queue"),
            Some(JobClass::Notification)
        );
        assert_eq!("Invoice".parse::<JobClass>().unwrap(), JobClass::Invoice);
        assert!("sms".parse::<JobClass>().is_err());
    }

    #[test]
    fn test_decode_wire_example() {
        let bytes = br#"{"id":"msg_1700000000000000001","type":"email","payload":{"to":"a@b"},"timestamp":"2024-01-01T00:00:00Z","attempts":0,"max_retries":3}"#;
        let envelope = decode(bytes).unwrap();

        assert_eq!(envelope.id, "msg_1700000000000000001");
        assert_eq!(envelope.class, JobClass::Email);
        assert_eq!(envelope.payload["to"], json!("a@b"));
        assert_eq!(envelope.max_retries, 3);
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_decode_defaults_missing_counters() {
        let envelope =
            decode(br#"{"id":"e1","type":"email","payload":{},"max_retries":3}"#).unwrap();
        assert_eq!(envelope.attempts, 0);
        assert_eq!(envelope.max_retries, 3);
    }

    #[test]
    fn test_decode_malformed() {
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"id":"x","type":"fax","payload":{}}"#,
            br#"{"id":"x","type":"email"}"#,
            br#"{"id":"  ","type":"email","payload":{}}"#,
        ];
        for bytes in cases {
            let err = decode(bytes).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        }
    }

    #[test]
    fn test_encode_decode_identity() {
        let envelope = Envelope::from_record(
            JobClass::Analytics,
            &json!({"event_id": "ev1", "properties": {"b": 2, "a": 1}}),
            1,
        )
        .unwrap();

        let bytes = encode(&envelope).unwrap();
        assert_eq!(decode(&bytes).unwrap(), envelope);
        assert!(std::str::from_utf8(&bytes).is_ok());
    }

    #[test]
    fn test_from_record_rejects_non_object() {
        let err = Envelope::from_record(JobClass::Email, &json!([1, 2]), 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_message_ids_are_monotonic_and_unique() {
        let ids: Vec<u64> = (0..1000)
            .map(|_| next_message_id()["msg_".len()..].parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_retry_budget() {
        let mut envelope = Envelope::new(JobClass::Email, Payload::new(), 2);
        envelope.attempts = 2;
        assert!(envelope.has_retries_left());
        envelope.attempts = 3;
        assert!(!envelope.has_retries_left());
    }
}
