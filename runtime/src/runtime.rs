//! Top-level runtime object: owns the registry, buses, lifecycle services,
//! and authority services, and drives phase-ordered boot and teardown.

use crate::config::RuntimeConfig;
use crate::llm::{mock_mode_active, MockLlmService, OpenAiCompatibleClient, OpenAiConfig};
use async_trait::async_trait;
use axum::Router;
use fabric_authority::{AuthenticationService, TaskStore, WiseAuthorityService};
use fabric_buses::{BusCore, DistributionStrategy, LlmBus, MessageBus, RuntimeControlBus, WiseBus};
use fabric_contracts::{
    KillSwitchConfig, LogTelemetry, Priority, ProcessorHandle, ProcessorQueueStatus, Service,
    ServiceInstance, ServiceType, TokenLedger, CAP_CALL_LLM_STRUCTURED, CAP_FETCH_GUIDANCE,
    CAP_SEND_DEFERRAL,
};
use fabric_control::{emergency_routes, EmergencyState, RuntimeControlService};
use fabric_lifecycle::{
    InitializationPhase, InitializationService, InitializationStep, ResourceMonitor,
    ResourceSignalBus, ShutdownService,
};
use fabric_registry::{ServiceRegistration, ServiceRegistry};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RUNTIME_CONTROL_CAPABILITIES: [&str; 11] = [
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
];

/// Minimal in-process agent processor backing pause/step/resume.
pub struct InProcessProcessor {
    pool: SqlitePool,
    paused: AtomicBool,
    items_processed: AtomicU64,
}

impl InProcessProcessor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, paused: AtomicBool::new(false), items_processed: AtomicU64::new(0) }
    }
}

#[async_trait]
impl ProcessorHandle for InProcessProcessor {
    async fn pause(&self) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        true
    }

    async fn resume(&self) -> bool {
        self.paused.store(false, Ordering::SeqCst);
        true
    }

    async fn single_step(&self) -> bool {
        if self.paused.load(Ordering::SeqCst) {
            self.items_processed.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    async fn queue_status(&self) -> ProcessorQueueStatus {
        let queue_size: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);
        ProcessorQueueStatus {
            queue_size: queue_size.max(0) as u64,
            processing: !self.paused.load(Ordering::SeqCst),
            current_item: None,
            items_processed: self.items_processed.load(Ordering::SeqCst),
            average_processing_time_ms: None,
        }
    }
}

/// The long-running agent fabric process.
pub struct AgentRuntime {
    config: RuntimeConfig,
    pool: SqlitePool,
    registry: Arc<ServiceRegistry>,
    llm_bus: Arc<LlmBus>,
    wise_bus: Arc<WiseBus>,
    control_bus: Arc<RuntimeControlBus>,
    shutdown: Arc<ShutdownService>,
    initialization: Arc<InitializationService>,
    monitor: Arc<ResourceMonitor>,
    auth: Arc<AuthenticationService>,
    wise_authority: Arc<WiseAuthorityService>,
    control: Arc<RuntimeControlService>,
}

impl AgentRuntime {
    pub async fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&config.key_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

        // Stores create their schemas up front; boot verifies them.
        let _tasks = TaskStore::new(pool.clone()).await?;
        let auth = Arc::new(AuthenticationService::new(pool.clone(), &config.key_dir).await?);
        let wise_authority = Arc::new(WiseAuthorityService::new(pool.clone(), Arc::clone(&auth)));

        let shutdown = Arc::new(ShutdownService::new());
        let signal_bus = Arc::new(ResourceSignalBus::new());
        {
            // Resource pressure with a shutdown action stops the agent.
            let shutdown = Arc::clone(&shutdown);
            signal_bus.register(
                "shutdown",
                Arc::new(move |_signal, resource| {
                    let shutdown = Arc::clone(&shutdown);
                    Box::pin(async move {
                        shutdown
                            .request_shutdown(&format!("resource limit exceeded: {}", resource));
                    })
                }),
            );
        }
        let monitor = Arc::new(ResourceMonitor::new(
            config.budget.clone(),
            Some(pool.clone()),
            &config.db_path,
            signal_bus,
        ));

        let processor = Arc::new(InProcessProcessor::new(pool.clone()));
        let control = Arc::new(RuntimeControlService::new(
            Some(processor as Arc<dyn ProcessorHandle>),
            Some(Arc::clone(&shutdown)),
        ));
        control.configure_kill_switch(KillSwitchConfig {
            enabled: !config.emergency_keys.is_empty(),
            root_keys: config.emergency_keys.clone(),
        });

        let registry = Arc::new(ServiceRegistry::new(vec![
            ServiceType::WiseAuthority,
            ServiceType::RuntimeControl,
        ]));

        let llm_bus = Arc::new(
            LlmBus::new(
                Arc::clone(&registry),
                DistributionStrategy::LatencyBased,
                Arc::new(LogTelemetry),
            )
            .with_token_ledger(Arc::clone(&monitor) as Arc<dyn TokenLedger>),
        );
        let wise_bus = Arc::new(WiseBus::new(Arc::clone(&registry)));
        let control_bus = Arc::new(RuntimeControlBus::new(Arc::clone(&registry)));

        Ok(Self {
            config,
            pool,
            registry,
            llm_bus,
            wise_bus,
            control_bus,
            shutdown,
            initialization: Arc::new(InitializationService::new()),
            monitor,
            auth,
            wise_authority,
            control,
        })
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn llm_bus(&self) -> Arc<LlmBus> {
        Arc::clone(&self.llm_bus)
    }

    pub fn wise_bus(&self) -> Arc<WiseBus> {
        Arc::clone(&self.wise_bus)
    }

    pub fn control_bus(&self) -> Arc<RuntimeControlBus> {
        Arc::clone(&self.control_bus)
    }

    pub fn shutdown_service(&self) -> Arc<ShutdownService> {
        Arc::clone(&self.shutdown)
    }

    pub fn resource_monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn authentication(&self) -> Arc<AuthenticationService> {
        Arc::clone(&self.auth)
    }

    pub fn initialization(&self) -> Arc<InitializationService> {
        Arc::clone(&self.initialization)
    }

    /// Router serving the emergency shutdown surface.
    pub fn emergency_router(&self) -> Router {
        emergency_routes(EmergencyState {
            control: Some(Arc::clone(&self.control)),
            shutdown: Some(Arc::clone(&self.shutdown)),
            authorized_keys: self.config.emergency_keys.values().cloned().collect(),
        })
    }

    /// Register the boot sequence and run it to completion.
    pub async fn boot(&self) -> anyhow::Result<()> {
        self.register_boot_steps();
        if !self.initialization.initialize().await {
            let status = self.initialization.status();
            anyhow::bail!(
                "initialization failed: {}",
                status.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(())
    }

    fn register_boot_steps(&self) {
        let init = &self.initialization;

        {
            let shutdown = Arc::clone(&self.shutdown);
            let verify = Arc::clone(&self.shutdown);
            init.register_step(InitializationStep {
                phase: InitializationPhase::Infrastructure,
                name: "lifecycle_services".to_string(),
                handler: Box::new(move || {
                    let shutdown = Arc::clone(&shutdown);
                    Box::pin(async move { shutdown.start().await })
                }),
                verifier: Some(Box::new(move || {
                    let shutdown = Arc::clone(&verify);
                    Box::pin(async move { shutdown.is_healthy().await })
                })),
                critical: true,
                timeout: Duration::from_secs(10),
            });
        }

        {
            let pool = self.pool.clone();
            init.register_step(InitializationStep {
                phase: InitializationPhase::Database,
                name: "stores".to_string(),
                handler: Box::new(move || {
                    let pool = pool.clone();
                    Box::pin(async move {
                        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks")
                            .fetch_one(&pool)
                            .await?;
                        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM wa_cert")
                            .fetch_one(&pool)
                            .await?;
                        Ok(())
                    })
                }),
                verifier: None,
                critical: true,
                timeout: Duration::from_secs(15),
            });
        }

        {
            let auth = Arc::clone(&self.auth);
            let verify = Arc::clone(&self.auth);
            init.register_step(InitializationStep {
                phase: InitializationPhase::Security,
                name: "identity_bootstrap".to_string(),
                handler: Box::new(move || {
                    let auth = Arc::clone(&auth);
                    Box::pin(async move {
                        auth.start().await?;
                        auth.bootstrap_if_needed().await?;
                        Ok(())
                    })
                }),
                verifier: Some(Box::new(move || {
                    let auth = Arc::clone(&verify);
                    Box::pin(async move { auth.is_healthy().await })
                })),
                critical: true,
                timeout: Duration::from_secs(30),
            });
        }

        {
            let registry = Arc::clone(&self.registry);
            let wise = Arc::clone(&self.wise_authority);
            let control = Arc::clone(&self.control);
            let monitor = Arc::clone(&self.monitor);
            let config = self.config.clone();
            init.register_step(InitializationStep {
                phase: InitializationPhase::Services,
                name: "register_providers".to_string(),
                handler: Box::new(move || {
                    let registry = Arc::clone(&registry);
                    let wise = Arc::clone(&wise);
                    let control = Arc::clone(&control);
                    let monitor = Arc::clone(&monitor);
                    let config = config.clone();
                    Box::pin(async move {
                        wise.start().await?;
                        control.start().await?;

                        registry
                            .register_service(
                                ServiceRegistration::new(
                                    ServiceType::WiseAuthority,
                                    ServiceInstance::WiseAuthority(wise),
                                )
                                .priority(Priority::Normal)
                                .capabilities([CAP_SEND_DEFERRAL, CAP_FETCH_GUIDANCE]),
                            )
                            .map_err(anyhow::Error::from)?;

                        registry
                            .register_service(
                                ServiceRegistration::new(
                                    ServiceType::RuntimeControl,
                                    ServiceInstance::RuntimeControl(control),
                                )
                                .priority(Priority::Critical)
                                .capabilities(RUNTIME_CONTROL_CAPABILITIES),
                            )
                            .map_err(anyhow::Error::from)?;

                        registry
                            .register_service(
                                ServiceRegistration::new(
                                    ServiceType::Visibility,
                                    ServiceInstance::Other(monitor),
                                )
                                .priority(Priority::Normal)
                                .capabilities(["resource_monitoring", "resource_signals"]),
                            )
                            .map_err(anyhow::Error::from)?;

                        register_llm_services(&registry, &config)?;
                        Ok(())
                    })
                }),
                verifier: None,
                critical: true,
                timeout: Duration::from_secs(30),
            });
        }

        {
            let llm_bus = Arc::clone(&self.llm_bus);
            let wise_bus = Arc::clone(&self.wise_bus);
            let control_bus = Arc::clone(&self.control_bus);
            let monitor = Arc::clone(&self.monitor);
            init.register_step(InitializationStep {
                phase: InitializationPhase::Components,
                name: "buses_and_monitor".to_string(),
                handler: Box::new(move || {
                    let llm_bus = Arc::clone(&llm_bus);
                    let wise_bus = Arc::clone(&wise_bus);
                    let control_bus = Arc::clone(&control_bus);
                    let monitor = Arc::clone(&monitor);
                    Box::pin(async move {
                        BusCore::start(llm_bus).await;
                        BusCore::start(wise_bus).await;
                        BusCore::start(control_bus).await;
                        monitor.spawn();
                        Ok(())
                    })
                }),
                verifier: None,
                critical: true,
                timeout: Duration::from_secs(10),
            });
        }

        {
            let registry = Arc::clone(&self.registry);
            init.register_step(InitializationStep {
                phase: InitializationPhase::Verification,
                name: "registry_ready".to_string(),
                handler: Box::new(|| Box::pin(async { Ok(()) })),
                verifier: Some(Box::new(move || {
                    let registry = Arc::clone(&registry);
                    Box::pin(async move {
                        registry
                            .wait_ready(
                                Duration::from_secs(5),
                                Some(&[ServiceType::WiseAuthority, ServiceType::RuntimeControl]),
                            )
                            .await
                    })
                })),
                critical: true,
                timeout: Duration::from_secs(10),
            });
        }
    }

    /// Wait for shutdown, run async handlers, and tear the fabric down.
    /// Returns the process exit code: 0 graceful, 1 emergency.
    pub async fn run(&self) -> i32 {
        self.shutdown.wait_for_shutdown().await;
        info!(
            "Runtime shutting down: {}",
            self.shutdown.shutdown_reason().unwrap_or_else(|| "unspecified".to_string())
        );

        self.shutdown.execute_async_handlers().await;

        self.llm_bus.core().stop();
        self.wise_bus.core().stop();
        self.control_bus.core().stop();
        if let Err(e) = self.monitor.stop().await {
            warn!("Resource monitor stop failed: {}", e);
        }
        if let Err(e) = self.wise_authority.stop().await {
            warn!("Wise authority stop failed: {}", e);
        }
        if let Err(e) = self.control.stop().await {
            warn!("Runtime control stop failed: {}", e);
        }
        if let Err(e) = self.auth.stop().await {
            warn!("Authentication stop failed: {}", e);
        }
        if let Err(e) = self.shutdown.stop().await {
            warn!("Shutdown service stop failed: {}", e);
        }

        if self.shutdown.is_emergency() {
            1
        } else {
            0
        }
    }
}

/// Register LLM providers from the environment.
///
/// Mock mode registers only the mock provider, at CRITICAL priority. A real
/// primary registers at HIGH from `OPENAI_API_KEY`; an optional secondary
/// registers at NORMAL from the `CIRIS_OPENAI_*_2` variables. The registry
/// interlock rejects any mock/real mixture.
fn register_llm_services(
    registry: &Arc<ServiceRegistry>,
    config: &RuntimeConfig,
) -> anyhow::Result<()> {
    if config.mock_llm || mock_mode_active() {
        warn!("MOCK LLM SERVICE ACTIVE - ALL RESPONSES ARE SIMULATED");
        registry
            .register_service(
                ServiceRegistration::new(
                    ServiceType::Llm,
                    ServiceInstance::Llm(Arc::new(MockLlmService::new())),
                )
                .priority(Priority::Critical)
                .capabilities([CAP_CALL_LLM_STRUCTURED])
                .metadata_entry("provider", "mock")
                .metadata_entry("warning", "MOCK LLM - NOT FOR PRODUCTION"),
            )
            .map_err(anyhow::Error::from)?;
        return Ok(());
    }

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        info!("No API key found and mock_llm not set - skipping LLM initialization");
        return Ok(());
    }

    let primary = OpenAiCompatibleClient::new(OpenAiConfig {
        api_key,
        base_url: config.llm.endpoint.clone(),
        model_name: config.llm.model.clone(),
        timeout_seconds: config.llm.timeout_seconds,
        max_retries: config.llm.max_retries,
    })?;
    let model = primary.model_name().to_string();
    registry
        .register_service(
            ServiceRegistration::new(ServiceType::Llm, ServiceInstance::Llm(Arc::new(primary)))
                .priority(Priority::High)
                .capabilities([CAP_CALL_LLM_STRUCTURED])
                .metadata_entry("provider", "openai")
                .metadata_entry("model", model),
        )
        .map_err(anyhow::Error::from)?;

    if let Ok(secondary_key) = std::env::var("CIRIS_OPENAI_API_KEY_2") {
        let base_url = std::env::var("CIRIS_OPENAI_API_BASE_2")
            .unwrap_or_else(|_| config.llm.endpoint.clone());
        let model_name = std::env::var("CIRIS_OPENAI_MODEL_NAME_2")
            .unwrap_or_else(|_| config.llm.model.clone());
        let secondary = OpenAiCompatibleClient::new(OpenAiConfig {
            api_key: secondary_key,
            base_url,
            model_name: model_name.clone(),
            timeout_seconds: config.llm.timeout_seconds,
            max_retries: config.llm.max_retries,
        })?;
        registry
            .register_service(
                ServiceRegistration::new(
                    ServiceType::Llm,
                    ServiceInstance::Llm(Arc::new(secondary)),
                )
                .priority(Priority::Normal)
                .capabilities([CAP_CALL_LLM_STRUCTURED])
                .metadata_entry("provider", "openai")
                .metadata_entry("model", model_name),
            )
            .map_err(anyhow::Error::from)?;
        info!("Registered secondary LLM provider");
    }

    Ok(())
}
