//! Serialization and degradation behavior of the runtime control bus.

use async_trait::async_trait;
use fabric_buses::RuntimeControlBus;
use fabric_contracts::{
    AdapterInfo, ConfigSnapshot, EmergencyShutdownStatus, Priority, ProcessorControlResponse,
    ProcessorQueueStatus, ProcessorStatus, RuntimeControl, RuntimeStatus, Service,
    ServiceInstance, ServiceType, WASignedCommand,
};
use fabric_registry::{ServiceRegistration, ServiceRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct StubControl {
    name: String,
    pauses: AtomicU64,
}

impl StubControl {
    fn new() -> Arc<Self> {
        Arc::new(Self { name: "StubControl".to_string(), pauses: AtomicU64::new(0) })
    }
}

#[async_trait]
impl Service for StubControl {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RuntimeControl for StubControl {
    async fn get_processor_queue_status(&self) -> ProcessorQueueStatus {
        ProcessorQueueStatus { queue_size: 4, processing: true, ..Default::default() }
    }

    async fn shutdown_runtime(&self, _reason: &str) -> ProcessorControlResponse {
        ProcessorControlResponse::ok("shutdown", ProcessorStatus::Stopped)
    }

    async fn get_config(&self, _path: Option<&str>, _include_sensitive: bool) -> ConfigSnapshot {
        ConfigSnapshot { version: "1".to_string(), ..Default::default() }
    }

    async fn load_adapter(
        &self,
        adapter_type: &str,
        adapter_id: &str,
        config: serde_json::Value,
        _auto_start: bool,
    ) -> AdapterInfo {
        AdapterInfo {
            adapter_id: adapter_id.to_string(),
            adapter_type: adapter_type.to_string(),
            status: "active".to_string(),
            loaded_at: chrono::Utc::now(),
            configuration: config,
            metrics: None,
        }
    }

    async fn unload_adapter(&self, adapter_id: &str, _force: bool) -> AdapterInfo {
        AdapterInfo {
            adapter_id: adapter_id.to_string(),
            adapter_type: "stub".to_string(),
            status: "stopped".to_string(),
            loaded_at: chrono::Utc::now(),
            configuration: serde_json::json!({}),
            metrics: None,
        }
    }

    async fn list_adapters(&self) -> Vec<AdapterInfo> {
        Vec::new()
    }

    async fn get_adapter_info(&self, _adapter_id: &str) -> Option<AdapterInfo> {
        None
    }

    async fn pause_processing(&self) -> ProcessorControlResponse {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        ProcessorControlResponse::ok("pause", ProcessorStatus::Paused)
    }

    async fn resume_processing(&self) -> ProcessorControlResponse {
        ProcessorControlResponse::ok("resume", ProcessorStatus::Running)
    }

    async fn single_step(&self) -> ProcessorControlResponse {
        ProcessorControlResponse::ok("single_step", ProcessorStatus::Paused)
    }

    async fn get_runtime_status(&self) -> RuntimeStatus {
        RuntimeStatus { status: "healthy".to_string(), ..Default::default() }
    }

    async fn handle_emergency_shutdown(&self, command: WASignedCommand) -> EmergencyShutdownStatus {
        EmergencyShutdownStatus::received_at(command.issued_at)
    }
}

fn registry_with_stub() -> (Arc<ServiceRegistry>, Arc<StubControl>) {
    let registry = Arc::new(ServiceRegistry::default());
    let stub = StubControl::new();
    registry
        .register_service(
            ServiceRegistration::new(
                ServiceType::RuntimeControl,
                ServiceInstance::RuntimeControl(Arc::clone(&stub) as Arc<dyn RuntimeControl>),
            )
            .priority(Priority::Critical)
            .capabilities([
                "get_processor_queue_status",
                "shutdown_runtime",
                "get_config",
                "load_adapter",
                "unload_adapter",
                "list_adapters",
                "get_adapter_info",
                "pause_processing",
                "resume_processing",
                "single_step",
                "get_runtime_status",
            ]),
        )
        .unwrap();
    (registry, stub)
}

#[tokio::test]
async fn absent_service_yields_typed_error_responses() {
    let registry = Arc::new(ServiceRegistry::default());
    let bus = RuntimeControlBus::new(registry);

    let queue = bus.get_processor_queue_status("test").await;
    assert_eq!(queue.queue_size, 0);
    assert!(!queue.processing);

    let response = bus.pause_processing("test").await;
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap().contains("unavailable"));

    let snapshot = bus.get_config(None, false, "test").await;
    assert_eq!(snapshot.version, "unknown");
    assert!(snapshot.metadata.contains_key("error"));

    let status = bus.get_runtime_status("test").await;
    assert_eq!(status.status, "error");
    assert!(!status.shutting_down);
}

#[tokio::test]
async fn operations_flow_through_the_registered_service() {
    let (registry, stub) = registry_with_stub();
    let bus = RuntimeControlBus::new(registry);

    let queue = bus.get_processor_queue_status("test").await;
    assert_eq!(queue.queue_size, 4);

    let response = bus.pause_processing("test").await;
    assert!(response.success);
    assert_eq!(response.new_status, Some(ProcessorStatus::Paused));
    assert_eq!(stub.pauses.load(Ordering::SeqCst), 1);

    let response = bus.resume_processing("test").await;
    assert!(response.success);

    let info = bus
        .load_adapter("discord", "discord-1", serde_json::json!({ "token": "x" }), true, "test")
        .await;
    assert_eq!(info.status, "active");
}

#[tokio::test]
async fn shutdown_latches_and_refuses_mutating_operations() {
    let (registry, stub) = registry_with_stub();
    let bus = RuntimeControlBus::new(registry);

    let response = bus.shutdown_runtime("test complete", "test").await;
    assert!(response.success);
    assert!(bus.is_shutting_down());

    // A second shutdown is absorbed.
    let response = bus.shutdown_runtime("again", "test").await;
    assert!(response.success);
    assert_eq!(
        response.result.unwrap()["message"],
        serde_json::json!("Already shutting down")
    );

    let response = bus.pause_processing("test").await;
    assert!(!response.success);
    assert!(response.error.as_deref().unwrap().contains("shutting down"));
    assert_eq!(stub.pauses.load(Ordering::SeqCst), 0);

    let info = bus
        .load_adapter("discord", "discord-2", serde_json::json!({}), true, "test")
        .await;
    assert_eq!(info.status, "error");

    let status = bus.get_runtime_status("test").await;
    assert!(status.shutting_down);
}

#[tokio::test]
async fn single_step_is_serialized_by_the_operation_lock() {
    let (registry, _stub) = registry_with_stub();
    let bus = Arc::new(RuntimeControlBus::new(registry));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let bus = Arc::clone(&bus);
        handles.push(tokio::spawn(async move { bus.single_step("test").await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }
}
