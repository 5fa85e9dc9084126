//! Analytics handler: window check, idempotent store, real-time counters.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::AnalyticsHandler;
use crate::error::{JobResult, Result, WorkerError};
use crate::jobs::JobContext;
use crate::messaging::payload::AnalyticsEvent;

/// Durable event storage.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Store `event` keyed by `event_id`. Returns `false` when it was already stored.
    async fn store(&self, event: &AnalyticsEvent) -> Result<bool>;
}

/// Real-time per-type counters.
#[async_trait]
pub trait AnalyticsCounters: Send + Sync {
    async fn increment(&self, event_type: &str) -> Result<()>;
}

/// In-memory sink and counters.
#[derive(Debug, Default)]
pub struct InMemoryAnalyticsSink {
    events: DashMap<String, AnalyticsEvent>,
    counters: DashMap<String, u64>,
    unavailable: AtomicBool,
}

impl InMemoryAnalyticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `store` fail with a transient error while `false`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, event_id: &str) -> Option<AnalyticsEvent> {
        self.events.get(event_id).map(|entry| entry.clone())
    }

    pub fn count(&self, event_type: &str) -> u64 {
        self.counters.get(event_type).map(|entry| *entry).unwrap_or(0)
    }
}

#[async_trait]
impl AnalyticsSink for InMemoryAnalyticsSink {
    async fn store(&self, event: &AnalyticsEvent) -> Result<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WorkerError::transient_handler("analytics sink unavailable"));
        }
        match self.events.entry(event.event_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl AnalyticsCounters for InMemoryAnalyticsSink {
    async fn increment(&self, event_type: &str) -> Result<()> {
        *self.counters.entry(event_type.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Default [`AnalyticsHandler`].
pub struct SinkAnalyticsHandler {
    sink: Arc<dyn AnalyticsSink>,
    counters: Arc<dyn AnalyticsCounters>,
    max_age: Duration,
    max_skew: Duration,
}

impl SinkAnalyticsHandler {
    pub fn new(sink: Arc<dyn AnalyticsSink>, counters: Arc<dyn AnalyticsCounters>) -> Self {
        Self {
            sink,
            counters,
            max_age: Duration::hours(24),
            max_skew: Duration::hours(1),
        }
    }

    /// Required fields present and `timestamp` within `[now - 24h, now + 1h]`.
    pub fn validate(&self, event: &AnalyticsEvent) -> Result<()> {
        for (field, value) in [
            ("event_id", &event.event_id),
            ("event_type", &event.event_type),
            ("event_name", &event.event_name),
        ] {
            if value.trim().is_empty() {
                return Err(WorkerError::validation(format!("analytics `{}` is empty", field)));
            }
        }

        let now = Utc::now();
        if event.timestamp < now - self.max_age {
            return Err(WorkerError::validation(format!(
                "analytics event {} is older than 24h ({})",
                event.event_id, event.timestamp
            )));
        }
        if event.timestamp > now + self.max_skew {
            return Err(WorkerError::validation(format!(
                "analytics event {} is more than 1h in the future ({})",
                event.event_id, event.timestamp
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticsHandler for SinkAnalyticsHandler {
    async fn handle(&self, event: &AnalyticsEvent, ctx: &JobContext) -> JobResult {
        self.validate(event)?;

        let stored = ctx.cancellable(self.sink.store(event)).await??;
        if !stored {
            tracing::debug!(job_id = %ctx.job_id(), event_id = %event.event_id, "Analytics event already stored");
            return Ok(());
        }

        if let Err(e) = self.counters.increment(&event.event_type).await {
            tracing::warn!(
                job_id = %ctx.job_id(),
                event_type = %event.event_type,
                error = %e,
                "Failed to update real-time counters"
            );
        }
        Ok(())
    }
}
