//! Deterministic mock LLM provider.
//!
//! Registered as the only LLM provider when mock mode is active. All
//! responses are simulated and cost nothing.

use async_trait::async_trait;
use fabric_contracts::{
    LlmError, LlmService, ResourceUsage, Service, StructuredCallRequest, StructuredCallResponse,
};
use std::sync::atomic::{AtomicU64, Ordering};

pub const MOCK_MODEL_NAME: &str = "mock-model";

pub struct MockLlmService {
    name: String,
    calls: AtomicU64,
}

impl Default for MockLlmService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmService {
    pub fn new() -> Self {
        Self { name: "MockLlmService".to_string(), calls: AtomicU64::new(0) }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for MockLlmService {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn call_llm_structured(
        &self,
        request: StructuredCallRequest,
    ) -> Result<StructuredCallResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();

        // Rough token estimate keeps downstream accounting exercised
        // without pretending to be real usage.
        let prompt_tokens: u64 =
            request.messages.iter().map(|m| m.content.len() as u64 / 4).sum();

        Ok(StructuredCallResponse {
            value: serde_json::json!({
                "status": "ok",
                "echo": last_user,
                "call": call,
            }),
            usage: ResourceUsage {
                tokens_used: prompt_tokens + 8,
                tokens_input: prompt_tokens,
                tokens_output: 8,
                cost_cents: 0.0,
                carbon_grams: 0.0,
                energy_kwh: 0.0,
                model_used: Some(MOCK_MODEL_NAME.to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_contracts::ChatMessage;

    #[tokio::test]
    async fn echoes_the_last_user_message() {
        let mock = MockLlmService::new();
        let response = mock
            .call_llm_structured(StructuredCallRequest {
                messages: vec![
                    ChatMessage::system("be helpful"),
                    ChatMessage::user("first"),
                    ChatMessage::user("second"),
                ],
                max_tokens: 64,
                temperature: 0.0,
            })
            .await
            .unwrap();

        assert_eq!(response.value["echo"], "second");
        assert_eq!(response.usage.cost_cents, 0.0);
        assert_eq!(response.usage.model_used.as_deref(), Some(MOCK_MODEL_NAME));
        assert_eq!(mock.call_count(), 1);
    }
}
