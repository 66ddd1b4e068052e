//! LLM message bus: multi-provider structured-call routing with redundancy,
//! distribution strategies, circuit breakers, and usage metering.

use crate::base::{BusCore, BusMessage, MessageBus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fabric_contracts::{
    ChatMessage, LlmError, LlmService, ResourceUsage, ServiceType, StructuredCallRequest,
    TelemetrySink, TokenLedger, CAP_CALL_LLM_STRUCTURED,
};
use fabric_registry::ServiceRegistry;
use fabric_resilience::{CircuitBreaker, CircuitBreakerConfig};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Strategy for distributing requests among providers at the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    RoundRobin,
    LatencyBased,
    Random,
    LeastLoaded,
}

/// Metrics for a single LLM provider, scoped to this bus.
#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: f64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
}

impl ServiceMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_latency_ms / self.total_requests as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Terminal errors from the LLM failover chain.
#[derive(Debug, thiserror::Error)]
pub enum LlmBusError {
    #[error("no LLM services available for {handler}")]
    ServiceUnavailable { handler: String },

    #[error("all LLM services failed for {handler}; last error: {last_error}")]
    AllProvidersFailed { handler: String, last_error: String },

    /// Provider timeouts are surfaced without further retries to prevent
    /// storm amplification.
    #[error("LLM call timed out on {provider}")]
    Timeout { provider: String },

    #[error("structured response did not match the expected shape: {0}")]
    InvalidResponse(String),
}

struct Candidate {
    name: String,
    priority: u8,
    service: Arc<dyn LlmService>,
}

/// Message bus for all LLM operations.
///
/// Providers are grouped by registry priority; within a group one provider
/// is chosen by the configured [`DistributionStrategy`], and the remaining
/// group members (then lower groups) form the failover chain.
pub struct LlmBus {
    core: BusCore,
    registry: Arc<ServiceRegistry>,
    strategy: DistributionStrategy,
    breaker_config: CircuitBreakerConfig,
    metrics: DashMap<String, ServiceMetrics>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    round_robin_index: DashMap<u8, usize>,
    telemetry: Arc<dyn TelemetrySink>,
    token_ledger: Option<Arc<dyn TokenLedger>>,
}

impl LlmBus {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        strategy: DistributionStrategy,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        info!("LLMBus initialized with {:?} distribution strategy", strategy);
        Self {
            core: BusCore::new(ServiceType::Llm),
            registry,
            strategy,
            breaker_config: CircuitBreakerConfig::default(),
            metrics: DashMap::new(),
            breakers: DashMap::new(),
            round_robin_index: DashMap::new(),
            telemetry,
            token_ledger: None,
        }
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Wire token totals into the resource monitor.
    pub fn with_token_ledger(mut self, ledger: Arc<dyn TokenLedger>) -> Self {
        self.token_ledger = Some(ledger);
        self
    }

    /// Generate structured output using the best available provider.
    ///
    /// Walks priority groups in ascending order; within each group the
    /// distribution strategy orders the candidates and each is tried at most
    /// once. Successful calls record breaker successes and emit telemetry;
    /// retryable failures move to the next candidate; provider timeouts
    /// fast-fail the whole call.
    pub async fn call_llm_structured<T: DeserializeOwned>(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
        handler_name: &str,
    ) -> Result<(T, ResourceUsage), LlmBusError> {
        let started = Instant::now();
        let candidates = self.prioritized_candidates().await;

        if candidates.is_empty() {
            return Err(LlmBusError::ServiceUnavailable { handler: handler_name.to_string() });
        }

        let mut groups: BTreeMap<u8, Vec<Candidate>> = BTreeMap::new();
        for candidate in candidates {
            groups.entry(candidate.priority).or_default().push(candidate);
        }

        let request = StructuredCallRequest {
            messages,
            max_tokens,
            temperature,
        };

        let mut last_error: Option<String> = None;
        for (priority, group) in groups {
            let ordered = self.order_by_strategy(priority, group);

            for candidate in ordered {
                if !self.check_circuit_breaker(&candidate.name) {
                    warn!("Circuit breaker OPEN for {}, skipping", candidate.name);
                    continue;
                }

                debug!("Calling LLM service {} for {}", candidate.name, handler_name);
                let call = candidate.service.call_llm_structured(request.clone());
                let outcome =
                    tokio::time::timeout(self.breaker_config.timeout_duration, call).await;

                match outcome {
                    Ok(Ok(response)) => {
                        match serde_json::from_value::<T>(response.value.clone()) {
                            Ok(parsed) => {
                                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                                self.record_success(&candidate.name, latency_ms);
                                self.record_resource_telemetry(
                                    &candidate.name,
                                    handler_name,
                                    &response.usage,
                                    latency_ms,
                                )
                                .await;
                                if let Some(ledger) = &self.token_ledger {
                                    ledger.record_tokens(response.usage.tokens_used).await;
                                }
                                debug!(
                                    "LLM call successful via {} (latency: {:.2}ms)",
                                    candidate.name, latency_ms
                                );
                                return Ok((parsed, response.usage));
                            }
                            Err(e) => {
                                self.record_failure(&candidate.name);
                                last_error = Some(format!("invalid structured response: {}", e));
                                error!(
                                    "LLM service {} returned unparseable structure: {}",
                                    candidate.name, e
                                );
                            }
                        }
                    }
                    Ok(Err(err @ LlmError::Timeout { .. })) => {
                        self.record_failure(&candidate.name);
                        error!("LLM service {} timed out: {}", candidate.name, err);
                        return Err(LlmBusError::Timeout { provider: candidate.name });
                    }
                    Ok(Err(err)) => {
                        self.record_failure(&candidate.name);
                        last_error = Some(err.to_string());
                        error!("LLM service {} failed: {}", candidate.name, err);
                    }
                    Err(_) => {
                        self.record_failure(&candidate.name);
                        error!(
                            "LLM service {} exceeded the {}s call budget",
                            candidate.name,
                            self.breaker_config.timeout_duration.as_secs()
                        );
                        return Err(LlmBusError::Timeout { provider: candidate.name });
                    }
                }
            }
        }

        Err(LlmBusError::AllProvidersFailed {
            handler: handler_name.to_string(),
            last_error: last_error.unwrap_or_else(|| "no candidate passed selection".to_string()),
        })
    }

    /// All healthy, breaker-available providers with the structured-call
    /// capability, annotated with registry priority.
    async fn prioritized_candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for provider in self.registry.available_providers(ServiceType::Llm) {
            if !provider.capabilities.iter().any(|c| c == CAP_CALL_LLM_STRUCTURED) {
                continue;
            }
            let Some(service) = provider.instance.as_llm() else {
                continue;
            };
            if !service.is_healthy().await {
                debug!("LLM provider {} failed health check", provider.name);
                continue;
            }
            candidates.push(Candidate {
                name: provider.name.clone(),
                priority: provider.priority.value(),
                service,
            });
        }
        candidates
    }

    fn order_by_strategy(&self, priority: u8, mut group: Vec<Candidate>) -> Vec<Candidate> {
        if group.len() <= 1 {
            return group;
        }
        match self.strategy {
            DistributionStrategy::RoundRobin => {
                let start = {
                    let mut cursor = self.round_robin_index.entry(priority).or_insert(0);
                    let start = *cursor % group.len();
                    *cursor += 1;
                    start
                };
                group.rotate_left(start);
                group
            }
            DistributionStrategy::LatencyBased => {
                // Providers with no samples are tried first (warm-up bias).
                group.sort_by(|a, b| {
                    let (ma, mb) = (self.metrics_for(&a.name), self.metrics_for(&b.name));
                    let key = |m: &ServiceMetrics| {
                        if m.total_requests == 0 {
                            (0u8, 0.0)
                        } else {
                            (1u8, m.average_latency_ms())
                        }
                    };
                    key(&ma)
                        .partial_cmp(&key(&mb))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                group
            }
            DistributionStrategy::Random => {
                group.shuffle(&mut rand::thread_rng());
                group
            }
            DistributionStrategy::LeastLoaded => {
                group.sort_by_key(|c| self.metrics_for(&c.name).total_requests);
                group
            }
        }
    }

    fn metrics_for(&self, name: &str) -> ServiceMetrics {
        self.metrics.get(name).map(|m| m.clone()).unwrap_or_default()
    }

    fn check_circuit_breaker(&self, service_name: &str) -> bool {
        let breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service_name, self.breaker_config.clone()))
            })
            .clone();
        breaker.is_available()
    }

    fn record_success(&self, service_name: &str, latency_ms: f64) {
        let mut metrics = self.metrics.entry(service_name.to_string()).or_default();
        metrics.total_requests += 1;
        metrics.total_latency_ms += latency_ms;
        metrics.last_request_time = Some(Utc::now());
        metrics.consecutive_failures = 0;
        drop(metrics);

        if let Some(breaker) = self.breakers.get(service_name) {
            breaker.record_success();
        }
    }

    fn record_failure(&self, service_name: &str) {
        let mut metrics = self.metrics.entry(service_name.to_string()).or_default();
        metrics.total_requests += 1;
        metrics.failed_requests += 1;
        metrics.last_failure_time = Some(Utc::now());
        metrics.consecutive_failures += 1;
        drop(metrics);

        if let Some(breaker) = self.breakers.get(service_name) {
            breaker.record_failure();
        }
    }

    async fn record_resource_telemetry(
        &self,
        service_name: &str,
        handler_name: &str,
        usage: &ResourceUsage,
        latency_ms: f64,
    ) {
        let model = usage.model_used.as_deref().unwrap_or("unknown");
        let tags: [(&str, &str); 3] =
            [("service", service_name), ("model", model), ("handler", handler_name)];

        self.telemetry
            .record_metric("llm.tokens.total", usage.tokens_used as f64, &tags)
            .await;
        if usage.tokens_input > 0 {
            self.telemetry
                .record_metric("llm.tokens.input", usage.tokens_input as f64, &tags)
                .await;
        }
        if usage.tokens_output > 0 {
            self.telemetry
                .record_metric("llm.tokens.output", usage.tokens_output as f64, &tags)
                .await;
        }
        if usage.cost_cents > 0.0 {
            self.telemetry.record_metric("llm.cost.cents", usage.cost_cents, &tags).await;
        }
        if usage.carbon_grams > 0.0 {
            self.telemetry
                .record_metric("llm.environmental.carbon_grams", usage.carbon_grams, &tags)
                .await;
        }
        if usage.energy_kwh > 0.0 {
            self.telemetry
                .record_metric("llm.environmental.energy_kwh", usage.energy_kwh, &tags)
                .await;
        }
        self.telemetry.record_metric("llm.latency.ms", latency_ms, &tags).await;
    }

    /// Per-provider statistics for introspection.
    pub fn service_stats(&self) -> BTreeMap<String, LlmProviderStats> {
        let mut stats = BTreeMap::new();
        for entry in self.metrics.iter() {
            let breaker_state = self
                .breakers
                .get(entry.key())
                .map(|b| b.state().as_str().to_string())
                .unwrap_or_else(|| "none".to_string());
            stats.insert(
                entry.key().clone(),
                LlmProviderStats {
                    total_requests: entry.total_requests,
                    failed_requests: entry.failed_requests,
                    failure_rate: entry.failure_rate(),
                    average_latency_ms: entry.average_latency_ms(),
                    consecutive_failures: entry.consecutive_failures,
                    circuit_breaker_state: breaker_state,
                    last_request: entry.last_request_time,
                    last_failure: entry.last_failure_time,
                },
            );
        }
        stats
    }

    /// True when at least one healthy LLM provider is selectable.
    pub async fn is_healthy(&self, handler_name: &str) -> bool {
        self.registry
            .get_service(handler_name, ServiceType::Llm, &[])
            .await
            .is_some()
    }

    /// Capability sets of the currently available LLM providers.
    pub fn get_capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self
            .registry
            .available_providers(ServiceType::Llm)
            .into_iter()
            .flat_map(|p| p.capabilities.clone())
            .collect();
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    /// Clear bus-level circuit breakers and metrics.
    ///
    /// Exists purely for test isolation; using it in production would hide
    /// real provider failures.
    pub fn clear_circuit_breakers(&self) {
        warn!("Clearing all LLM circuit breakers - this should only happen in tests!");
        self.breakers.clear();
        self.metrics.clear();
    }
}

#[async_trait]
impl MessageBus for LlmBus {
    fn core(&self) -> &BusCore {
        &self.core
    }

    async fn process_message(&self, message: BusMessage) {
        warn!(
            "Async LLM processing not yet implemented; dropping message {}",
            message.id
        );
        self.core.record_failed();
    }
}

/// Introspection record for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct LlmProviderStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub consecutive_failures: u64,
    pub circuit_breaker_state: String,
    pub last_request: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}
