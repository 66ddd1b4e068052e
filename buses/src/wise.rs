//! Wise Authority message bus: broadcast deferrals, filtered guidance fetch.
//!
//! Deferrals fan out to every provider exposing the `send_deferral`
//! capability; the call succeeds if at least one provider accepts. Guidance
//! is single-target.

use crate::base::{BusCore, BusMessage, MessageBus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fabric_contracts::{
    DeferralContext, DeferralRequest, GuidanceContext, ServiceType, WiseAuthority,
    CAP_FETCH_GUIDANCE, CAP_SEND_DEFERRAL,
};
use fabric_registry::ServiceRegistry;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Errors surfaced at the WA bus boundary.
#[derive(Debug, thiserror::Error)]
pub enum WiseBusError {
    #[error("invalid deferral context: {0}")]
    Validation(String),
}

/// Message bus for all wise authority operations.
pub struct WiseBus {
    core: BusCore,
    registry: Arc<ServiceRegistry>,
}

impl WiseBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { core: BusCore::new(ServiceType::WiseAuthority), registry }
    }

    /// Broadcast a deferral to every WA provider with the `send_deferral`
    /// capability. Returns `Ok(true)` if at least one provider accepted;
    /// individual failures are logged but do not fail the call.
    pub async fn send_deferral(
        &self,
        context: DeferralContext,
        handler_name: &str,
    ) -> Result<bool, WiseBusError> {
        let request = Self::context_to_request(&context)?;

        let mut targets: Vec<(String, Arc<dyn WiseAuthority>)> = Vec::new();
        let mut seen = Vec::new();
        for provider in self.registry.available_providers(ServiceType::WiseAuthority) {
            if !provider.capabilities.iter().any(|c| c == CAP_SEND_DEFERRAL) {
                continue;
            }
            let Some(service) = provider.instance.as_wise_authority() else {
                continue;
            };
            let id = provider.instance.instance_id();
            if !seen.contains(&id) {
                seen.push(id);
                targets.push((provider.name.clone(), service));
            }
        }

        if targets.is_empty() {
            error!("No wise authority service available for {}", handler_name);
            return Ok(false);
        }

        debug!(
            "Broadcasting deferral for task {} to {} WA providers",
            request.task_id,
            targets.len()
        );

        let calls = targets.iter().map(|(name, service)| {
            let request = request.clone();
            let name = name.clone();
            let service = Arc::clone(service);
            async move {
                match service.send_deferral(request).await {
                    Ok(deferral_id) => {
                        info!("WA provider {} accepted deferral {}", name, deferral_id);
                        true
                    }
                    Err(e) => {
                        error!("WA provider {} rejected deferral: {}", name, e);
                        false
                    }
                }
            }
        });

        let accepted = join_all(calls).await.into_iter().filter(|ok| *ok).count();
        Ok(accepted > 0)
    }

    /// Fetch guidance from the first suitable WA provider.
    pub async fn fetch_guidance(
        &self,
        context: GuidanceContext,
        handler_name: &str,
    ) -> Option<String> {
        let instance = self
            .registry
            .get_service(handler_name, ServiceType::WiseAuthority, &[CAP_FETCH_GUIDANCE])
            .await?;
        let service = instance.as_wise_authority()?;

        match service.fetch_guidance(context).await {
            Ok(guidance) => guidance,
            Err(e) => {
                error!("Failed to fetch guidance: {}", e);
                None
            }
        }
    }

    /// Request a review (e.g. for identity variance); sugar over
    /// `send_deferral`.
    pub async fn request_review(
        &self,
        review_type: &str,
        review_data: serde_json::Value,
        handler_name: &str,
    ) -> Result<bool, WiseBusError> {
        let mut metadata = HashMap::new();
        metadata.insert("review_data".to_string(), review_data.to_string());
        metadata.insert("handler_name".to_string(), handler_name.to_string());

        let context = DeferralContext {
            thought_id: format!("review_{}_{}", review_type, handler_name),
            task_id: format!("review_task_{}", review_type),
            reason: format!("Review requested: {}", review_type),
            defer_until: None,
            metadata,
        };

        self.send_deferral(context, handler_name).await
    }

    /// Parse the boundary context into the provider-facing request.
    /// `defer_until` must be ISO-8601 when present; missing defaults to one
    /// hour from now.
    fn context_to_request(context: &DeferralContext) -> Result<DeferralRequest, WiseBusError> {
        let defer_until: DateTime<Utc> = match &context.defer_until {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| {
                    WiseBusError::Validation(format!("unparseable defer_until '{}': {}", raw, e))
                })?
                .with_timezone(&Utc),
            None => Utc::now() + Duration::hours(1),
        };

        Ok(DeferralRequest {
            task_id: context.task_id.clone(),
            thought_id: context.thought_id.clone(),
            reason: context.reason.clone(),
            defer_until,
            context: context.metadata.clone(),
        })
    }
}

#[async_trait]
impl MessageBus for WiseBus {
    fn core(&self) -> &BusCore {
        &self.core
    }

    async fn process_message(&self, message: BusMessage) {
        warn!(
            "Wise authority operations should be synchronous, got queued message {}",
            message.id
        );
        self.core.record_failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_until_accepts_z_suffix() {
        let context = DeferralContext {
            task_id: "t1".into(),
            thought_id: "th1".into(),
            reason: "needs human".into(),
            defer_until: Some("2026-03-01T12:00:00Z".into()),
            metadata: HashMap::new(),
        };
        let request = WiseBus::context_to_request(&context).unwrap();
        assert_eq!(request.defer_until.to_rfc3339(), "2026-03-01T12:00:00+00:00");
    }

    #[test]
    fn missing_defer_until_defaults_an_hour_out() {
        let context = DeferralContext {
            task_id: "t1".into(),
            thought_id: "th1".into(),
            reason: "needs human".into(),
            defer_until: None,
            metadata: HashMap::new(),
        };
        let request = WiseBus::context_to_request(&context).unwrap();
        let delta = request.defer_until - Utc::now();
        assert!(delta > Duration::minutes(59) && delta <= Duration::minutes(61));
    }

    #[test]
    fn malformed_defer_until_is_a_validation_error() {
        let context = DeferralContext {
            task_id: "t1".into(),
            thought_id: "th1".into(),
            reason: "needs human".into(),
            defer_until: Some("next tuesday".into()),
            metadata: HashMap::new(),
        };
        assert!(matches!(
            WiseBus::context_to_request(&context),
            Err(WiseBusError::Validation(_))
        ));
    }
}
