//! Health status types.
//!
//! - `HealthStatus`: state of one component or of the whole worker
//! - `ComponentHealth`: report of one component (broker, one per pool)
//! - `HealthReport`: aggregated report
//!
//! # Health Status Semantics
//!
//! - **Healthy**: fully operational
//! - **Degraded**: operational, but the worker health check fails
//!   (e.g. a job queue above its saturation threshold)
//! - **Unhealthy**: not operational (broker down, worker stopping)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// The worse of two statuses.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Health
// ═══════════════════════════════════════════════════════════════════════════════

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,

    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Latency of the check in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    pub checked_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Error details (only present if unhealthy)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            checked_at: Utc::now(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded)
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unhealthy)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    /// Add an error message (sets status to Unhealthy).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = HealthStatus::Unhealthy;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// The error, else the message, else the status.
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| self.status.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated health of the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst component status
    pub status: HealthStatus,

    pub service: String,

    pub version: String,

    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,

    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            service: service.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_secs: None,
            components: Vec::new(),
            summary: HealthSummary::default(),
        }
    }

    pub fn with_component(self, component: ComponentHealth) -> Self {
        self.with_components(vec![component])
    }

    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.status = self.status.combine(component.status);
            self.components.push(component);
        }
        self.update_summary();
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    pub fn is_operational(&self) -> bool {
        self.status.is_operational()
    }

    pub fn get_component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Components that are not healthy.
    pub fn failing(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components.iter().filter(|c| !c.is_healthy())
    }

    fn update_summary(&mut self) {
        let mut summary = HealthSummary {
            total: self.components.len(),
            ..Default::default()
        };
        for component in &self.components {
            match component.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }
        self.summary = summary;
    }
}

/// Summary counts for health report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_combine() {
        assert_eq!(HealthStatus::Healthy.combine(HealthStatus::Healthy), HealthStatus::Healthy);
        assert_eq!(HealthStatus::Healthy.combine(HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.combine(HealthStatus::Unhealthy), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_component_health_builder() {
        let health = ComponentHealth::healthy("broker")
            .with_message("rabbitmq connected")
            .with_latency(Duration::from_millis(3))
            .with_metadata("provider", "rabbitmq");

        assert!(health.is_healthy());
        assert_eq!(health.latency_ms, Some(3));
        assert_eq!(health.reason(), "rabbitmq connected");

        let failed = health.with_error("connection closed");
        assert_eq!(failed.status, HealthStatus::Unhealthy);
        assert_eq!(failed.reason(), "connection closed");
    }

    #[test]
    fn test_health_report_aggregation() {
        let report = HealthReport::new("shop-worker").with_components(vec![
            ComponentHealth::healthy("broker"),
            ComponentHealth::degraded("pool:email"),
            ComponentHealth::healthy("pool:invoice"),
        ]);

        assert_eq!(report.status(), HealthStatus::Degraded);
        assert!(report.is_operational());
        assert!(!report.is_healthy());
        assert_eq!(report.summary.degraded, 1);
        assert_eq!(report.failing().count(), 1);
        assert!(report.get_component("pool:invoice").is_some());
    }
}
