//! Service traits and the typed instance handle the registry hands to buses.

use crate::authority::{DeferralRequest, GuidanceContext};
use crate::errors::AuthorityError;
use crate::llm::{LlmError, StructuredCallRequest, StructuredCallResponse};
use crate::runtime_control::{
    AdapterInfo, ConfigSnapshot, EmergencyShutdownStatus, ProcessorControlResponse,
    ProcessorQueueStatus, RuntimeStatus, WASignedCommand,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Base contract every registered service satisfies.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable instance name, used to derive the registry provider name.
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Health probe consulted during provider selection. Failing it counts
    /// as a circuit-breaker failure.
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Structured-call LLM provider.
#[async_trait]
pub trait LlmService: Service {
    async fn call_llm_structured(
        &self,
        request: StructuredCallRequest,
    ) -> Result<StructuredCallResponse, LlmError>;
}

/// Wise Authority provider: accepts deferrals, serves guidance.
#[async_trait]
pub trait WiseAuthority: Service {
    /// Returns the deferral id on acceptance.
    async fn send_deferral(&self, deferral: DeferralRequest) -> Result<String, AuthorityError>;

    /// Returns WA-provided guidance if any has been attached out of band.
    async fn fetch_guidance(&self, context: GuidanceContext) -> Result<Option<String>, AuthorityError>;
}

/// Runtime control provider. Methods return typed responses with `error`
/// populated on failure rather than raising.
#[async_trait]
pub trait RuntimeControl: Service {
    async fn get_processor_queue_status(&self) -> ProcessorQueueStatus;
    async fn shutdown_runtime(&self, reason: &str) -> ProcessorControlResponse;
    async fn get_config(&self, path: Option<&str>, include_sensitive: bool) -> ConfigSnapshot;
    async fn load_adapter(
        &self,
        adapter_type: &str,
        adapter_id: &str,
        config: serde_json::Value,
        auto_start: bool,
    ) -> AdapterInfo;
    async fn unload_adapter(&self, adapter_id: &str, force: bool) -> AdapterInfo;
    async fn list_adapters(&self) -> Vec<AdapterInfo>;
    async fn get_adapter_info(&self, adapter_id: &str) -> Option<AdapterInfo>;
    async fn pause_processing(&self) -> ProcessorControlResponse;
    async fn resume_processing(&self) -> ProcessorControlResponse;
    async fn single_step(&self) -> ProcessorControlResponse;
    async fn get_runtime_status(&self) -> RuntimeStatus;
    async fn handle_emergency_shutdown(&self, command: WASignedCommand) -> EmergencyShutdownStatus;
}

/// Seam between the runtime control service and the agent processor.
#[async_trait]
pub trait ProcessorHandle: Send + Sync {
    async fn pause(&self) -> bool;
    async fn resume(&self) -> bool;
    async fn single_step(&self) -> bool;
    async fn queue_status(&self) -> ProcessorQueueStatus;
}

/// Sink for per-call token totals, implemented by the resource monitor.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn record_tokens(&self, tokens: u64);
}

/// Typed handle to a registered service instance.
///
/// One variant per bus-facing trait keeps dispatch typed without downcasts;
/// services consumed only through the base contract use `Other`.
#[derive(Clone)]
pub enum ServiceInstance {
    Llm(Arc<dyn LlmService>),
    WiseAuthority(Arc<dyn WiseAuthority>),
    RuntimeControl(Arc<dyn RuntimeControl>),
    Other(Arc<dyn Service>),
}

impl ServiceInstance {
    pub fn name(&self) -> &str {
        match self {
            ServiceInstance::Llm(s) => s.name(),
            ServiceInstance::WiseAuthority(s) => s.name(),
            ServiceInstance::RuntimeControl(s) => s.name(),
            ServiceInstance::Other(s) => s.name(),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self {
            ServiceInstance::Llm(s) => s.is_healthy().await,
            ServiceInstance::WiseAuthority(s) => s.is_healthy().await,
            ServiceInstance::RuntimeControl(s) => s.is_healthy().await,
            ServiceInstance::Other(s) => s.is_healthy().await,
        }
    }

    /// Identity of the underlying allocation, for deduplication in fan-out.
    pub fn instance_id(&self) -> usize {
        match self {
            ServiceInstance::Llm(s) => Arc::as_ptr(s) as *const () as usize,
            ServiceInstance::WiseAuthority(s) => Arc::as_ptr(s) as *const () as usize,
            ServiceInstance::RuntimeControl(s) => Arc::as_ptr(s) as *const () as usize,
            ServiceInstance::Other(s) => Arc::as_ptr(s) as *const () as usize,
        }
    }

    pub fn as_llm(&self) -> Option<Arc<dyn LlmService>> {
        match self {
            ServiceInstance::Llm(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    pub fn as_wise_authority(&self) -> Option<Arc<dyn WiseAuthority>> {
        match self {
            ServiceInstance::WiseAuthority(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    pub fn as_runtime_control(&self) -> Option<Arc<dyn RuntimeControl>> {
        match self {
            ServiceInstance::RuntimeControl(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ServiceInstance::Llm(_) => "Llm",
            ServiceInstance::WiseAuthority(_) => "WiseAuthority",
            ServiceInstance::RuntimeControl(_) => "RuntimeControl",
            ServiceInstance::Other(_) => "Other",
        };
        write!(f, "ServiceInstance::{}({})", kind, self.name())
    }
}
