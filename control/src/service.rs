//! Runtime control service: processor pause/step/resume, adapter
//! management, config snapshots, and emergency-shutdown verification.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fabric_authority::crypto::verify_signature;
use fabric_contracts::{
    AdapterInfo, ConfigSnapshot, EmergencyShutdownStatus, KillSwitchConfig, ProcessorControlResponse,
    ProcessorHandle, ProcessorQueueStatus, ProcessorStatus, RuntimeControl, RuntimeStatus, Service,
    WASignedCommand,
};
use fabric_lifecycle::ShutdownService;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const EVENT_RING_CAPACITY: usize = 1000;
const SENSITIVE_MARKERS: [&str; 4] = ["secret", "key", "token", "password"];

/// One entry in the bounded control-event audit ring.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub action: String,
    pub success: bool,
    pub detail: Option<String>,
}

/// Backs the runtime control bus and owns emergency-command verification.
pub struct RuntimeControlService {
    processor: Option<Arc<dyn ProcessorHandle>>,
    shutdown: Option<Arc<ShutdownService>>,
    adapters: DashMap<String, AdapterInfo>,
    config_values: RwLock<HashMap<String, serde_json::Value>>,
    config_version: RwLock<String>,
    kill_switch: RwLock<KillSwitchConfig>,
    events: Mutex<VecDeque<RuntimeEvent>>,
    processor_status: RwLock<ProcessorStatus>,
    started_at: DateTime<Utc>,
    running: AtomicBool,
}

impl RuntimeControlService {
    pub fn new(
        processor: Option<Arc<dyn ProcessorHandle>>,
        shutdown: Option<Arc<ShutdownService>>,
    ) -> Self {
        Self {
            processor,
            shutdown,
            adapters: DashMap::new(),
            config_values: RwLock::new(HashMap::new()),
            config_version: RwLock::new("1".to_string()),
            kill_switch: RwLock::new(KillSwitchConfig::default()),
            events: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
            processor_status: RwLock::new(ProcessorStatus::Running),
            started_at: Utc::now(),
            running: AtomicBool::new(false),
        }
    }

    /// Configure the emergency kill switch key map.
    pub fn configure_kill_switch(&self, config: KillSwitchConfig) {
        info!(
            "Kill switch configured: enabled={}, {} authorized keys",
            config.enabled,
            config.root_keys.len()
        );
        *self.kill_switch.write() = config;
    }

    pub fn set_config_value(&self, path: &str, value: serde_json::Value) {
        self.config_values.write().insert(path.to_string(), value);
        let mut version = self.config_version.write();
        let next: u64 = version.parse().unwrap_or(0) + 1;
        *version = next.to_string();
    }

    pub fn record_event(
        &self,
        category: &str,
        action: &str,
        success: bool,
        detail: Option<String>,
    ) {
        let mut events = self.events.lock();
        if events.len() >= EVENT_RING_CAPACITY {
            events.pop_front();
        }
        events.push_back(RuntimeEvent {
            timestamp: Utc::now(),
            category: category.to_string(),
            action: action.to_string(),
            success,
            detail,
        });
    }

    pub fn recent_events(&self, limit: usize) -> Vec<RuntimeEvent> {
        let events = self.events.lock();
        events.iter().rev().take(limit).cloned().collect()
    }

    /// Verify the Ed25519 signature on an emergency command against the
    /// kill-switch key map. The canonical form is the pipe-delimited string
    /// the client signed.
    fn verify_wa_signature(&self, command: &WASignedCommand) -> Result<(), String> {
        let kill_switch = self.kill_switch.read();
        let Some(key_b64) = kill_switch.root_keys.get(&command.wa_id) else {
            return Err(format!("WA {} not in authorized keys", command.wa_id));
        };
        let public_key = STANDARD
            .decode(key_b64)
            .map_err(|_| format!("stored key for {} is not valid base64", command.wa_id))?;
        if public_key.len() != 32 {
            return Err(format!("stored key for {} is not an Ed25519 key", command.wa_id));
        }

        let signed_data = command.canonical_string();
        if verify_signature(&public_key, signed_data.as_bytes(), &command.signature) {
            Ok(())
        } else {
            Err("Invalid WA signature".to_string())
        }
    }
}

#[async_trait]
impl RuntimeControl for RuntimeControlService {
    async fn get_processor_queue_status(&self) -> ProcessorQueueStatus {
        match &self.processor {
            Some(processor) => processor.queue_status().await,
            None => ProcessorQueueStatus::default(),
        }
    }

    async fn shutdown_runtime(&self, reason: &str) -> ProcessorControlResponse {
        warn!("Runtime shutdown initiated: {}", reason);
        *self.processor_status.write() = ProcessorStatus::Stopped;
        self.record_event("processor_control", "shutdown", true, Some(reason.to_string()));

        if let Some(shutdown) = &self.shutdown {
            shutdown.request_shutdown(reason);
        }
        ProcessorControlResponse::ok("shutdown", ProcessorStatus::Stopped)
    }

    async fn get_config(&self, path: Option<&str>, include_sensitive: bool) -> ConfigSnapshot {
        let values = self.config_values.read();
        let configs = values
            .iter()
            .filter(|(key, _)| path.map(|p| key.starts_with(p)).unwrap_or(true))
            .map(|(key, value)| {
                let lowered = key.to_lowercase();
                let masked = !include_sensitive
                    && SENSITIVE_MARKERS.iter().any(|marker| lowered.contains(marker));
                if masked {
                    (key.clone(), serde_json::Value::String("**redacted**".to_string()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect();
        ConfigSnapshot {
            configs,
            version: self.config_version.read().clone(),
            metadata: HashMap::new(),
        }
    }

    async fn load_adapter(
        &self,
        adapter_type: &str,
        adapter_id: &str,
        config: serde_json::Value,
        auto_start: bool,
    ) -> AdapterInfo {
        if self.adapters.contains_key(adapter_id) {
            return AdapterInfo::error(adapter_id, adapter_type, "Adapter id already loaded");
        }
        let info = AdapterInfo {
            adapter_id: adapter_id.to_string(),
            adapter_type: adapter_type.to_string(),
            status: if auto_start { "active" } else { "loaded" }.to_string(),
            loaded_at: Utc::now(),
            configuration: config,
            metrics: None,
        };
        self.adapters.insert(adapter_id.to_string(), info.clone());
        self.record_event("adapter", "load", true, Some(adapter_id.to_string()));
        info!("Loaded adapter {} ({})", adapter_id, adapter_type);
        info
    }

    async fn unload_adapter(&self, adapter_id: &str, force: bool) -> AdapterInfo {
        match self.adapters.remove(adapter_id) {
            Some((_, mut info)) => {
                info.status = "stopped".to_string();
                self.record_event("adapter", "unload", true, Some(adapter_id.to_string()));
                info!("Unloaded adapter {} (force={})", adapter_id, force);
                info
            }
            None => {
                self.record_event("adapter", "unload", false, Some(adapter_id.to_string()));
                AdapterInfo::error(adapter_id, "unknown", "Adapter not found")
            }
        }
    }

    async fn list_adapters(&self) -> Vec<AdapterInfo> {
        self.adapters.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn get_adapter_info(&self, adapter_id: &str) -> Option<AdapterInfo> {
        self.adapters.get(adapter_id).map(|entry| entry.value().clone())
    }

    async fn pause_processing(&self) -> ProcessorControlResponse {
        let Some(processor) = &self.processor else {
            return ProcessorControlResponse::failed("pause", "No processor attached");
        };
        if processor.pause().await {
            *self.processor_status.write() = ProcessorStatus::Paused;
            self.record_event("processor_control", "pause", true, None);
            ProcessorControlResponse::ok("pause", ProcessorStatus::Paused)
        } else {
            self.record_event("processor_control", "pause", false, None);
            ProcessorControlResponse::failed("pause", "Processor refused to pause")
        }
    }

    async fn resume_processing(&self) -> ProcessorControlResponse {
        let Some(processor) = &self.processor else {
            return ProcessorControlResponse::failed("resume", "No processor attached");
        };
        if processor.resume().await {
            *self.processor_status.write() = ProcessorStatus::Running;
            self.record_event("processor_control", "resume", true, None);
            ProcessorControlResponse::ok("resume", ProcessorStatus::Running)
        } else {
            self.record_event("processor_control", "resume", false, None);
            ProcessorControlResponse::failed("resume", "Processor refused to resume")
        }
    }

    async fn single_step(&self) -> ProcessorControlResponse {
        let Some(processor) = &self.processor else {
            return ProcessorControlResponse::failed("single_step", "No processor attached");
        };
        if processor.single_step().await {
            self.record_event("processor_control", "single_step", true, None);
            ProcessorControlResponse::ok("single_step", *self.processor_status.read())
        } else {
            debug!("Single step had no thoughts to process");
            ProcessorControlResponse::failed("single_step", "No thoughts to process")
        }
    }

    async fn get_runtime_status(&self) -> RuntimeStatus {
        RuntimeStatus {
            status: "healthy".to_string(),
            uptime_seconds: (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0,
            processor_status: Some(*self.processor_status.read()),
            adapters_loaded: self.adapters.len() as u64,
            recent_events: self
                .recent_events(10)
                .into_iter()
                .map(|e| format!("{} {}/{} ok={}", e.timestamp.to_rfc3339(), e.category, e.action, e.success))
                .collect(),
            active_operations: Vec::new(),
            shutting_down: false,
            error: None,
        }
    }

    /// Handle a WA-authorized emergency shutdown command.
    ///
    /// Verification failures populate `verification_error`; this method
    /// never raises.
    async fn handle_emergency_shutdown(&self, command: WASignedCommand) -> EmergencyShutdownStatus {
        error!("EMERGENCY SHUTDOWN COMMAND RECEIVED from WA {}", command.wa_id);
        let mut status = EmergencyShutdownStatus::received_at(Utc::now());

        if let Err(reason) = self.verify_wa_signature(&command) {
            status.verification_error = Some(reason.clone());
            error!("Emergency shutdown rejected: {} (WA {})", reason, command.wa_id);
            self.record_event("emergency_shutdown", "verify", false, Some(reason));
            return status;
        }

        status.command_verified = true;
        status.shutdown_initiated = Some(Utc::now());
        self.record_event(
            "emergency_shutdown",
            "command_verified",
            true,
            Some(format!("{} by {}", command.command_id, command.wa_id)),
        );

        let reason = format!(
            "WA EMERGENCY SHUTDOWN: {} (WA: {})",
            command.reason, command.wa_id
        );

        if let Some(shutdown) = &self.shutdown {
            shutdown.request_shutdown(&reason);
            info!("Emergency shutdown delegated to ShutdownService");
        } else {
            self.shutdown_runtime(&reason).await;
        }
        status.data_persisted = true;
        status.final_message_sent = true;
        status.shutdown_completed = Some(Utc::now());
        status.exit_code = Some(0);
        status
    }
}

#[async_trait]
impl Service for RuntimeControlService {
    fn name(&self) -> &str {
        "RuntimeControlService"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("RuntimeControlService started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        info!("RuntimeControlService stopped");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_authority::crypto::{generate_keypair, sign_data};
    use fabric_contracts::EmergencyCommandType;

    fn signed_command(
        wa_id: &str,
        pkcs8: &[u8],
        public: &[u8],
    ) -> (WASignedCommand, KillSwitchConfig) {
        let mut command = WASignedCommand {
            command_id: "cmd-1".to_string(),
            command_type: EmergencyCommandType::ShutdownNow,
            wa_id: wa_id.to_string(),
            wa_public_key: STANDARD.encode(public),
            issued_at: Utc::now(),
            expires_at: None,
            reason: "integrity drill".to_string(),
            target_agent_id: None,
            target_tree_path: None,
            signature: String::new(),
        };
        command.signature = sign_data(pkcs8, command.canonical_string().as_bytes()).unwrap();

        let mut root_keys = HashMap::new();
        root_keys.insert(wa_id.to_string(), STANDARD.encode(public));
        (command, KillSwitchConfig { enabled: true, root_keys })
    }

    #[tokio::test]
    async fn verified_command_triggers_shutdown() {
        let shutdown = Arc::new(ShutdownService::new());
        let service = RuntimeControlService::new(None, Some(Arc::clone(&shutdown)));

        let (pkcs8, public) = generate_keypair().unwrap();
        let (command, kill_switch) = signed_command("wa-2026-01-01-AB12CD", &pkcs8, &public);
        service.configure_kill_switch(kill_switch);

        let status = service.handle_emergency_shutdown(command).await;
        assert!(status.command_verified);
        assert!(status.verification_error.is_none());
        assert_eq!(status.exit_code, Some(0));
        assert!(shutdown.is_shutdown_requested());
        assert!(shutdown.shutdown_reason().unwrap().contains("WA EMERGENCY SHUTDOWN"));
    }

    #[tokio::test]
    async fn corrupted_signature_is_rejected_without_shutdown() {
        let shutdown = Arc::new(ShutdownService::new());
        let service = RuntimeControlService::new(None, Some(Arc::clone(&shutdown)));

        let (pkcs8, public) = generate_keypair().unwrap();
        let (mut command, kill_switch) = signed_command("wa-2026-01-01-AB12CD", &pkcs8, &public);
        service.configure_kill_switch(kill_switch);
        command.reason = "altered after signing".to_string();

        let status = service.handle_emergency_shutdown(command).await;
        assert!(!status.command_verified);
        assert!(status.verification_error.as_deref().unwrap().contains("Invalid WA signature"));
        assert!(!shutdown.is_shutdown_requested());
    }

    #[tokio::test]
    async fn unknown_wa_is_rejected() {
        let service = RuntimeControlService::new(None, None);
        let (pkcs8, public) = generate_keypair().unwrap();
        let (command, _) = signed_command("wa-2026-01-01-AB12CD", &pkcs8, &public);

        let status = service.handle_emergency_shutdown(command).await;
        assert!(!status.command_verified);
        assert!(status.verification_error.as_deref().unwrap().contains("not in authorized keys"));
    }

    #[tokio::test]
    async fn sensitive_config_is_masked_by_default() {
        let service = RuntimeControlService::new(None, None);
        service.set_config_value("services.llm_endpoint", serde_json::json!("https://api"));
        service.set_config_value("services.llm_api_key", serde_json::json!("sk-xyz"));

        let snapshot = service.get_config(None, false).await;
        assert_eq!(snapshot.configs["services.llm_endpoint"], serde_json::json!("https://api"));
        assert_eq!(snapshot.configs["services.llm_api_key"], serde_json::json!("**redacted**"));

        let snapshot = service.get_config(None, true).await;
        assert_eq!(snapshot.configs["services.llm_api_key"], serde_json::json!("sk-xyz"));

        let snapshot = service.get_config(Some("services.llm_api"), false).await;
        assert_eq!(snapshot.configs.len(), 1);
    }

    #[tokio::test]
    async fn adapters_load_list_and_unload() {
        let service = RuntimeControlService::new(None, None);
        let info = service
            .load_adapter("discord", "discord-main", serde_json::json!({ "guild": 1 }), true)
            .await;
        assert_eq!(info.status, "active");

        let dup = service
            .load_adapter("discord", "discord-main", serde_json::json!({}), true)
            .await;
        assert_eq!(dup.status, "error");

        assert_eq!(service.list_adapters().await.len(), 1);
        assert!(service.get_adapter_info("discord-main").await.is_some());

        let removed = service.unload_adapter("discord-main", false).await;
        assert_eq!(removed.status, "stopped");
        assert!(service.get_adapter_info("discord-main").await.is_none());

        let missing = service.unload_adapter("ghost", false).await;
        assert_eq!(missing.status, "error");
    }
}
