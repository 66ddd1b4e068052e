//! Resource budget, limits, and the monitor's snapshot.

use serde::{Deserialize, Serialize};

/// Protective action taken when a resource crosses a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Warn,
    Throttle,
    Defer,
    Reject,
    Shutdown,
}

impl ResourceAction {
    /// Signal name emitted on the resource signal bus.
    pub fn signal(&self) -> Option<&'static str> {
        match self {
            ResourceAction::Warn => None,
            ResourceAction::Throttle => Some("throttle"),
            ResourceAction::Defer => Some("defer"),
            ResourceAction::Reject => Some("reject"),
            ResourceAction::Shutdown => Some("shutdown"),
        }
    }
}

/// Thresholds for one named resource. Invariant: `warning <= critical <= limit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub limit: u64,
    pub warning: u64,
    pub critical: u64,
    pub action: ResourceAction,
    pub cooldown_seconds: u64,
}

impl ResourceLimit {
    pub fn new(limit: u64, warning: u64, critical: u64, action: ResourceAction, cooldown_seconds: u64) -> Self {
        debug_assert!(warning <= critical && critical <= limit);
        Self { limit, warning, critical, action, cooldown_seconds }
    }
}

/// Budget for every monitored resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub memory_mb: ResourceLimit,
    pub cpu_percent: ResourceLimit,
    pub tokens_hour: ResourceLimit,
    pub tokens_day: ResourceLimit,
    pub thoughts_active: ResourceLimit,
    pub disk_mb: ResourceLimit,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            memory_mb: ResourceLimit::new(4096, 3072, 3840, ResourceAction::Defer, 60),
            cpu_percent: ResourceLimit::new(100, 80, 95, ResourceAction::Throttle, 30),
            tokens_hour: ResourceLimit::new(10_000, 8_000, 9_500, ResourceAction::Defer, 300),
            tokens_day: ResourceLimit::new(100_000, 80_000, 95_000, ResourceAction::Reject, 3600),
            thoughts_active: ResourceLimit::new(50, 40, 48, ResourceAction::Defer, 60),
            disk_mb: ResourceLimit::new(10_240, 8_192, 9_728, ResourceAction::Warn, 300),
        }
    }
}

impl ResourceBudget {
    pub fn limit_for(&self, resource: &str) -> Option<&ResourceLimit> {
        match resource {
            "memory_mb" => Some(&self.memory_mb),
            "cpu_percent" => Some(&self.cpu_percent),
            "tokens_hour" => Some(&self.tokens_hour),
            "tokens_day" => Some(&self.tokens_day),
            "thoughts_active" => Some(&self.thoughts_active),
            "disk_mb" => Some(&self.disk_mb),
            _ => None,
        }
    }
}

/// Current resource view maintained by the monitor.
///
/// Readers get a clone; a single-step-stale view is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_mb: u64,
    pub memory_percent: u64,
    pub cpu_percent: u64,
    pub cpu_average_1m: u64,
    pub disk_free_mb: u64,
    pub disk_used_mb: u64,
    pub tokens_used_hour: u64,
    pub tokens_used_day: u64,
    pub thoughts_active: u64,
    pub warnings: Vec<String>,
    pub critical: Vec<String>,
    pub healthy: bool,
}

impl ResourceSnapshot {
    pub fn new() -> Self {
        Self { healthy: true, ..Default::default() }
    }
}
