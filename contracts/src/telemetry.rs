//! Telemetry sink consumed by the buses.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Receives metric points emitted by buses and services.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Sink that only logs; the default when no recorder is wired in.
#[derive(Debug, Default)]
pub struct LogTelemetry;

#[async_trait]
impl TelemetrySink for LogTelemetry {
    async fn record_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        tracing::debug!(metric = name, value, ?tags, "metric");
    }
}

/// In-memory recorder keyed by metric name. Used by tests and the
/// runtime-status surface.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    points: DashMap<String, Vec<f64>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn values(&self, name: &str) -> Vec<f64> {
        self.points.get(name).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.points.get(name).map(|v| v.len()).unwrap_or(0)
    }

    pub fn total(&self, name: &str) -> f64 {
        self.points.get(name).map(|v| v.iter().sum()).unwrap_or(0.0)
    }
}

#[async_trait]
impl TelemetrySink for InMemoryTelemetry {
    async fn record_metric(&self, name: &str, value: f64, _tags: &[(&str, &str)]) {
        self.points.entry(name.to_string()).or_default().push(value);
    }
}
