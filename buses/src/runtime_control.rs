//! Runtime Control message bus: serialized, safety-checked lifecycle
//! operations.
//!
//! Every state-changing operation is serialized behind a single operation
//! mutex; once shutdown begins, mutating operations are refused and tracked
//! in-flight operations are cancelled.

use crate::base::{BusCore, BusMessage, MessageBus};
use async_trait::async_trait;
use fabric_contracts::{
    AdapterInfo, ConfigSnapshot, ProcessorControlResponse, ProcessorQueueStatus, RuntimeControl,
    RuntimeStatus, ServiceType,
};
use fabric_registry::ServiceRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SERVICE_UNAVAILABLE: &str = "Runtime control service unavailable";

/// Message bus for all runtime control operations.
pub struct RuntimeControlBus {
    core: BusCore,
    registry: Arc<ServiceRegistry>,
    operation_lock: tokio::sync::Mutex<()>,
    active_operations: Mutex<HashMap<String, tokio::task::AbortHandle>>,
    shutting_down: AtomicBool,
}

impl RuntimeControlBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            core: BusCore::new(ServiceType::RuntimeControl),
            registry,
            operation_lock: tokio::sync::Mutex::new(()),
            active_operations: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn service(
        &self,
        handler_name: &str,
        capability: &str,
    ) -> Option<Arc<dyn RuntimeControl>> {
        let instance = self
            .registry
            .get_service(handler_name, ServiceType::RuntimeControl, &[capability])
            .await?;
        instance.as_runtime_control()
    }

    /// Run a service call in a tracked task so `shutdown_runtime` can cancel
    /// it. Cancellation surfaces as an error string, never a panic.
    async fn run_tracked<T, F>(&self, operation: &str, future: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.active_operations
            .lock()
            .insert(operation.to_string(), handle.abort_handle());
        let result = handle.await;
        self.active_operations.lock().remove(operation);
        result.map_err(|e| {
            if e.is_cancelled() {
                "operation cancelled".to_string()
            } else {
                format!("operation panicked: {}", e)
            }
        })
    }

    pub async fn get_processor_queue_status(&self, handler_name: &str) -> ProcessorQueueStatus {
        match self.service(handler_name, "get_processor_queue_status").await {
            Some(service) => service.get_processor_queue_status().await,
            None => {
                error!("No runtime control service available for {}", handler_name);
                ProcessorQueueStatus::default()
            }
        }
    }

    /// Shut the runtime down. Marks the bus as shutting down and cancels all
    /// tracked in-flight operations before delegating.
    pub async fn shutdown_runtime(
        &self,
        reason: &str,
        handler_name: &str,
    ) -> ProcessorControlResponse {
        let _guard = self.operation_lock.lock().await;

        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress");
            let mut response = ProcessorControlResponse::ok("shutdown", fabric_contracts::ProcessorStatus::Stopped);
            response.result = Some(serde_json::json!({ "message": "Already shutting down" }));
            return response;
        }

        warn!(
            "RUNTIME SHUTDOWN triggered by {}: reason='{}'",
            handler_name, reason
        );

        let cancelled: Vec<String> = {
            let mut ops = self.active_operations.lock();
            let names = ops.keys().cloned().collect();
            for (name, handle) in ops.drain() {
                info!("Cancelling active operation: {}", name);
                handle.abort();
            }
            names
        };
        if !cancelled.is_empty() {
            debug!("Cancelled {} active operations", cancelled.len());
        }

        match self.service(handler_name, "shutdown_runtime").await {
            Some(service) => service.shutdown_runtime(reason).await,
            None => {
                error!("No runtime control service available for {}", handler_name);
                ProcessorControlResponse::failed("shutdown", SERVICE_UNAVAILABLE)
            }
        }
    }

    pub async fn get_config(
        &self,
        path: Option<&str>,
        include_sensitive: bool,
        handler_name: &str,
    ) -> ConfigSnapshot {
        match self.service(handler_name, "get_config").await {
            Some(service) => service.get_config(path, include_sensitive).await,
            None => {
                error!("No runtime control service available for {}", handler_name);
                let mut snapshot = ConfigSnapshot { version: "unknown".to_string(), ..Default::default() };
                snapshot
                    .metadata
                    .insert("error".to_string(), SERVICE_UNAVAILABLE.to_string());
                snapshot
            }
        }
    }

    /// Load a new adapter instance. Refused once shutdown has started.
    pub async fn load_adapter(
        &self,
        adapter_type: &str,
        adapter_id: &str,
        config: serde_json::Value,
        auto_start: bool,
        handler_name: &str,
    ) -> AdapterInfo {
        if self.is_shutting_down() {
            warn!("Cannot load adapter during shutdown");
            return AdapterInfo::error(adapter_id, adapter_type, "System shutting down");
        }

        match self.service(handler_name, "load_adapter").await {
            Some(service) => {
                info!("Loading adapter {} of type {}", adapter_id, adapter_type);
                service.load_adapter(adapter_type, adapter_id, config, auto_start).await
            }
            None => {
                error!("No runtime control service available for {}", handler_name);
                AdapterInfo::error(adapter_id, adapter_type, SERVICE_UNAVAILABLE)
            }
        }
    }

    pub async fn unload_adapter(
        &self,
        adapter_id: &str,
        force: bool,
        handler_name: &str,
    ) -> AdapterInfo {
        match self.service(handler_name, "unload_adapter").await {
            Some(service) => {
                info!("Unloading adapter {}", adapter_id);
                service.unload_adapter(adapter_id, force).await
            }
            None => {
                error!("No runtime control service available for {}", handler_name);
                AdapterInfo::error(adapter_id, "unknown", SERVICE_UNAVAILABLE)
            }
        }
    }

    pub async fn list_adapters(&self, handler_name: &str) -> Vec<AdapterInfo> {
        match self.service(handler_name, "list_adapters").await {
            Some(service) => service.list_adapters().await,
            None => {
                error!("No runtime control service available for {}", handler_name);
                Vec::new()
            }
        }
    }

    pub async fn get_adapter_info(
        &self,
        adapter_id: &str,
        handler_name: &str,
    ) -> AdapterInfo {
        match self.service(handler_name, "get_adapter_info").await {
            Some(service) => match service.get_adapter_info(adapter_id).await {
                Some(info) => info,
                None => AdapterInfo::error(adapter_id, "unknown", "Adapter not found"),
            },
            None => {
                error!("No runtime control service available for {}", handler_name);
                AdapterInfo::error(adapter_id, "unknown", SERVICE_UNAVAILABLE)
            }
        }
    }

    /// Pause processor execution. Serialized; refused during shutdown.
    pub async fn pause_processing(&self, handler_name: &str) -> ProcessorControlResponse {
        if self.is_shutting_down() {
            warn!("Cannot pause processor during shutdown");
            return ProcessorControlResponse::failed("pause", "System shutting down");
        }

        let _guard = self.operation_lock.lock().await;
        match self.service(handler_name, "pause_processing").await {
            Some(service) => {
                info!("Pausing processor requested by {}", handler_name);
                let result = self
                    .run_tracked("pause_processing", async move {
                        service.pause_processing().await
                    })
                    .await;
                match result {
                    Ok(response) => response,
                    Err(e) => ProcessorControlResponse::failed("pause", e),
                }
            }
            None => {
                error!("No runtime control service available for {}", handler_name);
                ProcessorControlResponse::failed("pause", SERVICE_UNAVAILABLE)
            }
        }
    }

    /// Resume processor execution. Serialized; refused during shutdown.
    pub async fn resume_processing(&self, handler_name: &str) -> ProcessorControlResponse {
        if self.is_shutting_down() {
            warn!("Cannot resume processor during shutdown");
            return ProcessorControlResponse::failed("resume", "System shutting down");
        }

        let _guard = self.operation_lock.lock().await;
        match self.service(handler_name, "resume_processing").await {
            Some(service) => {
                info!("Resuming processor requested by {}", handler_name);
                let result = self
                    .run_tracked("resume_processing", async move {
                        service.resume_processing().await
                    })
                    .await;
                match result {
                    Ok(response) => response,
                    Err(e) => ProcessorControlResponse::failed("resume", e),
                }
            }
            None => {
                error!("No runtime control service available for {}", handler_name);
                ProcessorControlResponse::failed("resume", SERVICE_UNAVAILABLE)
            }
        }
    }

    /// Execute a single processing step. Serialized; refused during shutdown.
    pub async fn single_step(&self, handler_name: &str) -> ProcessorControlResponse {
        if self.is_shutting_down() {
            warn!("Cannot single-step during shutdown");
            return ProcessorControlResponse::failed("single_step", "System shutting down");
        }

        let _guard = self.operation_lock.lock().await;
        match self.service(handler_name, "single_step").await {
            Some(service) => {
                debug!("Single step requested by {}", handler_name);
                let result = self
                    .run_tracked("single_step", async move { service.single_step().await })
                    .await;
                match result {
                    Ok(response) => response,
                    Err(e) => ProcessorControlResponse::failed("single_step", e),
                }
            }
            None => {
                error!("No runtime control service available for {}", handler_name);
                ProcessorControlResponse::failed("single_step", SERVICE_UNAVAILABLE)
            }
        }
    }

    /// Runtime status, safe to call anytime. Augments the service response
    /// with bus-level state.
    pub async fn get_runtime_status(&self, handler_name: &str) -> RuntimeStatus {
        let mut status = match self.service(handler_name, "get_runtime_status").await {
            Some(service) => service.get_runtime_status().await,
            None => {
                error!("No runtime control service available for {}", handler_name);
                RuntimeStatus {
                    status: "error".to_string(),
                    error: Some(SERVICE_UNAVAILABLE.to_string()),
                    ..Default::default()
                }
            }
        };
        status.active_operations = self.active_operations.lock().keys().cloned().collect();
        status.shutting_down = self.is_shutting_down();
        status
    }

    pub async fn is_healthy(&self, handler_name: &str) -> bool {
        match self.registry.get_service(handler_name, ServiceType::RuntimeControl, &[]).await {
            Some(instance) => instance.is_healthy().await && !self.is_shutting_down(),
            None => false,
        }
    }
}

#[async_trait]
impl MessageBus for RuntimeControlBus {
    fn core(&self) -> &BusCore {
        &self.core
    }

    async fn process_message(&self, message: BusMessage) {
        warn!(
            "Runtime control operations should be synchronous, got queued message {}",
            message.id
        );
        self.core.record_failed();
    }
}
