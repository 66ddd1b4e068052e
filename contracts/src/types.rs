//! Core enums and registry-facing records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Closed enumeration of pluggable service kinds.
///
/// The ordinal is stable and used as the primary key of the service registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Llm,
    Memory,
    Audit,
    Communication,
    WiseAuthority,
    Time,
    Shutdown,
    Initialization,
    RuntimeControl,
    Visibility,
    Tool,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Llm => "llm",
            ServiceType::Memory => "memory",
            ServiceType::Audit => "audit",
            ServiceType::Communication => "communication",
            ServiceType::WiseAuthority => "wise_authority",
            ServiceType::Time => "time",
            ServiceType::Shutdown => "shutdown",
            ServiceType::Initialization => "initialization",
            ServiceType::RuntimeControl => "runtime_control",
            ServiceType::Visibility => "visibility",
            ServiceType::Tool => "tool",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service priority levels for fallback ordering. Lower value wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Fallback,
}

impl Priority {
    /// Numeric ordering value; `FALLBACK` is deliberately distant.
    pub fn value(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Fallback => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
            Priority::Fallback => "FALLBACK",
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

/// Provider selection strategy within a priority group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First available provider wins.
    Fallback,
    /// Rotate through providers with a per-group cursor.
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Fallback => "fallback",
            SelectionStrategy::RoundRobin => "round_robin",
        }
    }
}

/// Free-form provider metadata. LLM providers must carry a `provider` key.
pub type ServiceMetadata = HashMap<String, String>;

/// Capability name for structured LLM calls.
pub const CAP_CALL_LLM_STRUCTURED: &str = "call_llm_structured";
/// Capability name for deferral submission.
pub const CAP_SEND_DEFERRAL: &str = "send_deferral";
/// Capability name for guidance fetch.
pub const CAP_FETCH_GUIDANCE: &str = "fetch_guidance";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_by_value() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Low < Priority::Fallback);
        assert_eq!(Priority::Fallback.value(), 9);
    }

    #[test]
    fn service_type_round_trips_through_serde() {
        let json = serde_json::to_string(&ServiceType::WiseAuthority).unwrap();
        assert_eq!(json, "\"wise_authority\"");
        let back: ServiceType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServiceType::WiseAuthority);
    }
}
