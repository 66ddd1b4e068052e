use fabric_contracts::{
    Priority, SelectionStrategy, ServiceInstance, ServiceMetadata, ServiceType,
};
use fabric_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Errors raised by registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("security violation: {0}")]
    SecurityViolation(String),
}

/// A registered provider together with its circuit breaker.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub name: String,
    pub service_type: ServiceType,
    pub priority: Priority,
    pub priority_group: i32,
    pub strategy: SelectionStrategy,
    pub capabilities: Vec<String>,
    pub metadata: ServiceMetadata,
    pub instance: ServiceInstance,
    pub breaker: Arc<CircuitBreaker>,
}

impl RegisteredProvider {
    fn is_mock(&self) -> bool {
        self.name.contains("Mock")
            || self.metadata.get("provider").map(String::as_str) == Some("mock")
    }
}

/// Registration request; defaults mirror the common case.
pub struct ServiceRegistration {
    pub service_type: ServiceType,
    pub instance: ServiceInstance,
    pub priority: Priority,
    pub capabilities: Vec<String>,
    pub breaker_config: Option<CircuitBreakerConfig>,
    pub metadata: ServiceMetadata,
    pub priority_group: i32,
    pub strategy: SelectionStrategy,
}

impl ServiceRegistration {
    pub fn new(service_type: ServiceType, instance: ServiceInstance) -> Self {
        Self {
            service_type,
            instance,
            priority: Priority::Normal,
            capabilities: Vec::new(),
            breaker_config: None,
            metadata: ServiceMetadata::new(),
            priority_group: 0,
            strategy: SelectionStrategy::Fallback,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn priority_group(mut self, group: i32) -> Self {
        self.priority_group = group;
        self
    }

    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Introspection view of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub priority: String,
    pub priority_group: i32,
    pub strategy: String,
    pub capabilities: Vec<String>,
    pub metadata: ServiceMetadata,
    pub circuit_breaker_state: CircuitState,
}

/// Full introspection report for `get_provider_info`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProviderInfoReport {
    pub services: HashMap<String, Vec<ProviderInfo>>,
    pub circuit_breaker_stats: HashMap<String, CircuitBreakerStats>,
}

/// Central registry for all services with priority/fallback support.
pub struct ServiceRegistry {
    services: RwLock<HashMap<ServiceType, Vec<Arc<RegisteredProvider>>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    rr_state: Mutex<HashMap<String, usize>>,
    required_types: Vec<ServiceType>,
    seq: AtomicU64,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(vec![
            ServiceType::Communication,
            ServiceType::Memory,
            ServiceType::Audit,
            ServiceType::Llm,
        ])
    }
}

impl ServiceRegistry {
    pub fn new(required_types: Vec<ServiceType>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            rr_state: Mutex::new(HashMap::new()),
            required_types,
            seq: AtomicU64::new(1),
        }
    }

    /// Register a provider. Returns the unique provider name.
    ///
    /// For `ServiceType::Llm`, refuses to mix mock and real providers: a
    /// provider is classified mock iff its name contains `Mock` or its
    /// metadata carries `provider = "mock"`.
    pub fn register_service(&self, reg: ServiceRegistration) -> Result<String, RegistryError> {
        let handle = self.seq.fetch_add(1, Ordering::Relaxed);
        let provider_name = format!("{}_{}", reg.instance.name(), handle);

        let mut services = self.services.write();
        let providers = services.entry(reg.service_type).or_default();

        if reg.service_type == ServiceType::Llm {
            let is_mock = provider_name.contains("Mock")
                || reg.metadata.get("provider").map(String::as_str) == Some("mock");
            for existing in providers.iter() {
                if existing.is_mock() != is_mock {
                    let msg = format!(
                        "attempted to register {} LLM service while {} service already exists \
                         (existing: {}, new: {})",
                        if is_mock { "mock" } else { "real" },
                        if existing.is_mock() { "mock" } else { "real" },
                        existing.name,
                        provider_name,
                    );
                    error!("SECURITY VIOLATION: {}", msg);
                    return Err(RegistryError::SecurityViolation(msg));
                }
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(
            format!("{}_{}", reg.service_type, provider_name),
            reg.breaker_config.unwrap_or_default(),
        ));
        self.breakers.write().insert(provider_name.clone(), Arc::clone(&breaker));

        providers.push(Arc::new(RegisteredProvider {
            name: provider_name.clone(),
            service_type: reg.service_type,
            priority: reg.priority,
            priority_group: reg.priority_group,
            strategy: reg.strategy,
            capabilities: reg.capabilities.clone(),
            metadata: reg.metadata,
            instance: reg.instance,
            breaker,
        }));
        providers.sort_by_key(|p| (p.priority_group, p.priority.value()));

        info!(
            "Registered {} service '{}' with priority {} and capabilities {:?}",
            reg.service_type,
            provider_name,
            reg.priority.name(),
            reg.capabilities,
        );
        Ok(provider_name)
    }

    /// Get the best available service of `service_type`.
    ///
    /// Iterates priority groups ascending; within a group applies the
    /// group's selection strategy, then capability, breaker, and health
    /// filters. The first passing candidate wins and its breaker records a
    /// success.
    pub async fn get_service(
        &self,
        handler: &str,
        service_type: ServiceType,
        required_capabilities: &[&str],
    ) -> Option<ServiceInstance> {
        debug!(
            "get_service: handler='{}' type='{}' capabilities={:?}",
            handler, service_type, required_capabilities
        );

        let providers = self.snapshot(service_type);
        if providers.is_empty() {
            warn!("No {} providers registered (handler '{}')", service_type, handler);
            return None;
        }

        let mut grouped: std::collections::BTreeMap<i32, Vec<Arc<RegisteredProvider>>> =
            std::collections::BTreeMap::new();
        for p in providers {
            grouped.entry(p.priority_group).or_default().push(p);
        }

        for (group, group_providers) in grouped {
            let strategy = group_providers[0].strategy;
            let candidates: Vec<Arc<RegisteredProvider>> = match strategy {
                SelectionStrategy::RoundRobin => {
                    let key = format!("{}:{}", service_type, group);
                    let start = {
                        let mut rr = self.rr_state.lock();
                        let idx = rr.entry(key).or_insert(0);
                        let start = *idx % group_providers.len();
                        *idx = (start + 1) % group_providers.len();
                        start
                    };
                    let mut rotated = Vec::with_capacity(group_providers.len());
                    for i in 0..group_providers.len() {
                        rotated.push(Arc::clone(&group_providers[(start + i) % group_providers.len()]));
                    }
                    rotated
                }
                SelectionStrategy::Fallback => group_providers,
            };

            for provider in candidates {
                if let Some(instance) = self.validate_provider(&provider, required_capabilities).await
                {
                    return Some(instance);
                }
            }
        }

        warn!(
            "No available {} service found with capabilities {:?}",
            service_type, required_capabilities
        );
        None
    }

    async fn validate_provider(
        &self,
        provider: &RegisteredProvider,
        required_capabilities: &[&str],
    ) -> Option<ServiceInstance> {
        for cap in required_capabilities {
            if !provider.capabilities.iter().any(|c| c == cap) {
                debug!("Provider '{}' missing capability '{}'", provider.name, cap);
                return None;
            }
        }

        if !provider.breaker.is_available() {
            debug!("Provider '{}' circuit breaker is open", provider.name);
            return None;
        }

        if !provider.instance.is_healthy().await {
            debug!("Provider '{}' failed health check", provider.name);
            provider.breaker.record_failure();
            return None;
        }

        provider.breaker.record_success();
        debug!(
            "Selected provider '{}' with priority {}",
            provider.name,
            provider.priority.name()
        );
        Some(provider.instance.clone())
    }

    /// Every currently available instance of `service_type`, deduplicated by
    /// instance identity. Used for broadcast fan-out.
    pub fn get_services_by_type(&self, service_type: ServiceType) -> Vec<ServiceInstance> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for provider in self.snapshot(service_type) {
            if provider.breaker.is_available() {
                let id = provider.instance.instance_id();
                if !seen.contains(&id) {
                    seen.push(id);
                    out.push(provider.instance.clone());
                }
            }
        }
        out
    }

    /// Available providers with their registration records, for buses that
    /// apply their own selection (LLM distribution, WA broadcast).
    pub fn available_providers(&self, service_type: ServiceType) -> Vec<Arc<RegisteredProvider>> {
        self.snapshot(service_type)
            .into_iter()
            .filter(|p| p.breaker.is_available())
            .collect()
    }

    /// Introspection: provider lists plus breaker stats.
    pub fn get_provider_info(&self, service_type: Option<ServiceType>) -> ProviderInfoReport {
        let mut report = ProviderInfoReport::default();
        for (st, providers) in self.services.read().iter() {
            if let Some(filter) = service_type {
                if *st != filter {
                    continue;
                }
            }
            report.services.insert(
                st.to_string(),
                providers
                    .iter()
                    .map(|p| ProviderInfo {
                        name: p.name.clone(),
                        priority: p.priority.name().to_string(),
                        priority_group: p.priority_group,
                        strategy: p.strategy.as_str().to_string(),
                        capabilities: p.capabilities.clone(),
                        metadata: p.metadata.clone(),
                        circuit_breaker_state: p.breaker.state(),
                    })
                    .collect(),
            );
        }
        for (name, breaker) in self.breakers.read().iter() {
            report.circuit_breaker_stats.insert(name.clone(), breaker.stats());
        }
        report
    }

    /// Unregister a provider by the name `register_service` returned.
    /// Removes the provider and its breaker atomically.
    pub fn unregister(&self, provider_name: &str) -> bool {
        let mut services = self.services.write();
        for (service_type, providers) in services.iter_mut() {
            if let Some(pos) = providers.iter().position(|p| p.name == provider_name) {
                providers.remove(pos);
                self.breakers.write().remove(provider_name);
                info!("Unregistered {} provider '{}'", service_type, provider_name);
                return true;
            }
        }
        false
    }

    /// Clear all registered services and circuit breakers.
    pub fn clear_all(&self) {
        self.services.write().clear();
        self.breakers.write().clear();
        self.rr_state.lock().clear();
        info!("Cleared all services from registry");
    }

    /// Reset all circuit breakers to closed state.
    pub fn reset_circuit_breakers(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
        info!("Reset all circuit breakers");
    }

    /// Poll until every required service type has at least one provider, or
    /// the timeout elapses.
    pub async fn wait_ready(
        &self,
        timeout: Duration,
        service_types: Option<&[ServiceType]>,
    ) -> bool {
        let required: Vec<ServiceType> =
            service_types.map(|s| s.to_vec()).unwrap_or_else(|| self.required_types.clone());
        if required.is_empty() {
            return true;
        }

        let start = Instant::now();
        loop {
            let missing: Vec<ServiceType> = {
                let services = self.services.read();
                required
                    .iter()
                    .filter(|st| services.get(st).map(|v| v.is_empty()).unwrap_or(true))
                    .copied()
                    .collect()
            };
            if missing.is_empty() {
                info!("Service registry ready: all services registered");
                return true;
            }
            if start.elapsed() >= timeout {
                error!(
                    "Service registry readiness timeout. Missing services: {}",
                    missing.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", ")
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn snapshot(&self, service_type: ServiceType) -> Vec<Arc<RegisteredProvider>> {
        self.services.read().get(&service_type).cloned().unwrap_or_default()
    }
}
