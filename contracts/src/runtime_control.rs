//! Runtime-control schemas: processor state, adapters, config snapshots,
//! and the WA-signed emergency shutdown command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Processor execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorStatus {
    Running,
    Paused,
    Stopped,
}

impl ProcessorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorStatus::Running => "running",
            ProcessorStatus::Paused => "paused",
            ProcessorStatus::Stopped => "stopped",
        }
    }
}

/// Snapshot of the processor's work queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorQueueStatus {
    pub queue_size: u64,
    pub processing: bool,
    pub current_item: Option<String>,
    pub items_processed: u64,
    pub average_processing_time_ms: Option<f64>,
}

/// Typed response for processor-control operations. Failures populate
/// `error` instead of raising across the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorControlResponse {
    pub success: bool,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub new_status: Option<ProcessorStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ProcessorControlResponse {
    pub fn ok(operation: &str, new_status: ProcessorStatus) -> Self {
        Self {
            success: true,
            operation: operation.to_string(),
            timestamp: Utc::now(),
            new_status: Some(new_status),
            result: None,
            error: None,
        }
    }

    pub fn failed(operation: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            operation: operation.to_string(),
            timestamp: Utc::now(),
            new_status: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Point-in-time view of configuration values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub configs: HashMap<String, serde_json::Value>,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A loaded adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub adapter_id: String,
    pub adapter_type: String,
    pub status: String,
    pub loaded_at: DateTime<Utc>,
    pub configuration: serde_json::Value,
    pub metrics: Option<serde_json::Value>,
}

impl AdapterInfo {
    pub fn error(adapter_id: &str, adapter_type: &str, message: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.to_string(),
            adapter_type: adapter_type.to_string(),
            status: "error".to_string(),
            loaded_at: Utc::now(),
            configuration: serde_json::json!({ "error": message.into() }),
            metrics: None,
        }
    }
}

/// Overall runtime status, augmented by the bus with its own state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub status: String,
    pub uptime_seconds: f64,
    pub processor_status: Option<ProcessorStatus>,
    pub adapters_loaded: u64,
    pub recent_events: Vec<String>,
    #[serde(default)]
    pub active_operations: Vec<String>,
    #[serde(default)]
    pub shutting_down: bool,
    pub error: Option<String>,
}

/// Command type of a WA-signed emergency command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyCommandType {
    ShutdownNow,
    FreezeAll,
    SafeMode,
}

impl EmergencyCommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyCommandType::ShutdownNow => "SHUTDOWN_NOW",
            EmergencyCommandType::FreezeAll => "FREEZE_ALL",
            EmergencyCommandType::SafeMode => "SAFE_MODE",
        }
    }
}

/// Cryptographically signed emergency command from a Wise Authority.
///
/// The signature covers the pipe-delimited canonical form produced by
/// [`WASignedCommand::canonical_string`]; both the HTTP endpoint and the
/// runtime control service must rebuild it identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WASignedCommand {
    pub command_id: String,
    pub command_type: EmergencyCommandType,
    pub wa_id: String,
    /// Base64-encoded raw 32-byte Ed25519 public key.
    pub wa_public_key: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    #[serde(default)]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub target_tree_path: Option<String>,
    /// Base64-encoded Ed25519 signature over the canonical string.
    pub signature: String,
}

impl WASignedCommand {
    /// Pipe-delimited `key:value` pairs in fixed order. `target_agent_id`
    /// is appended only when present.
    pub fn canonical_string(&self) -> String {
        let mut signed = format!(
            "command_id:{}|command_type:{}|wa_id:{}|issued_at:{}|reason:{}",
            self.command_id,
            self.command_type.as_str(),
            self.wa_id,
            self.issued_at.to_rfc3339(),
            self.reason,
        );
        if let Some(target) = &self.target_agent_id {
            signed.push_str(&format!("|target_agent_id:{}", target));
        }
        signed
    }
}

/// Outcome of processing an emergency command. Verification failures are
/// reported here, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyShutdownStatus {
    pub command_received: DateTime<Utc>,
    pub command_verified: bool,
    pub verification_error: Option<String>,
    pub shutdown_initiated: Option<DateTime<Utc>>,
    pub data_persisted: bool,
    pub final_message_sent: bool,
    pub shutdown_completed: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl EmergencyShutdownStatus {
    pub fn received_at(now: DateTime<Utc>) -> Self {
        Self {
            command_received: now,
            command_verified: false,
            verification_error: None,
            shutdown_initiated: None,
            data_persisted: false,
            final_message_sent: false,
            shutdown_completed: None,
            exit_code: None,
        }
    }
}

/// Authorized emergency keys: WA id to base64 raw Ed25519 public key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    pub enabled: bool,
    pub root_keys: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_appends_target_only_when_present() {
        let mut cmd = WASignedCommand {
            command_id: "cmd-1".into(),
            command_type: EmergencyCommandType::ShutdownNow,
            wa_id: "wa-2026-01-01-AAAAAA".into(),
            wa_public_key: String::new(),
            issued_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            expires_at: None,
            reason: "drill".into(),
            target_agent_id: None,
            target_tree_path: None,
            signature: String::new(),
        };
        let base = cmd.canonical_string();
        assert!(base.starts_with("command_id:cmd-1|command_type:SHUTDOWN_NOW|"));
        assert!(!base.contains("target_agent_id"));

        cmd.target_agent_id = Some("agent-7".into());
        assert!(cmd.canonical_string().ends_with("|target_agent_id:agent-7"));
    }
}
