//! OpenAI-compatible structured-call client.
//!
//! Speaks the chat-completions wire shape against any compatible endpoint.
//! Transient failures (connection errors, rate limits) retry with
//! exponential backoff; API errors and timeouts do not.

use crate::llm::pricing;
use async_trait::async_trait;
use fabric_contracts::{
    LlmError, LlmService, Service, StructuredCallRequest, StructuredCallResponse,
};
use fabric_resilience::{RetryConfig, RetryExecutor};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// Settings for one OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
        }
    }
}

/// True when the process runs with mock LLMs: the `MOCK_LLM` env var or a
/// `--mock-llm` argument.
pub fn mock_mode_active() -> bool {
    std::env::var_os("MOCK_LLM").is_some() || std::env::args().any(|arg| arg == "--mock-llm")
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Real LLM provider. Construction aborts when mock mode is active, so a
/// simulated and a real model can never coexist in one process.
pub struct OpenAiCompatibleClient {
    config: OpenAiConfig,
    http: reqwest::Client,
    retry: RetryExecutor,
    name: String,
}

impl OpenAiCompatibleClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if mock_mode_active() {
            error!(
                "OpenAiCompatibleClient constructed while mock LLM mode is enabled; \
                 the mock module must be the only LLM provider"
            );
            return Err(LlmError::MockModeViolation);
        }
        if config.api_key.is_empty() {
            return Err(LlmError::Api("api key is required for a real LLM provider".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        let retry = RetryExecutor::new(RetryConfig {
            max_attempts: config.max_retries.max(1),
            ..RetryConfig::default()
        });

        info!("OpenAI-compatible LLM client created for model {}", config.model_name);
        Ok(Self { name: "OpenAiCompatibleClient".to_string(), config, http, retry })
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn call_once(
        &self,
        request: &StructuredCallRequest,
    ) -> Result<StructuredCallResponse, LlmError> {
        let body = serde_json::json!({
            "model": self.config.model_name,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout { timeout_ms: self.config.timeout_seconds * 1000 }
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited(format!("{} from {}", status, self.config.base_url)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{}: {}", status, detail)));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LlmError::InvalidResponse("no choices returned".to_string()))?;

        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| LlmError::InvalidResponse(format!("content is not JSON: {}", e)))?;

        let usage = completion.usage.unwrap_or_default();
        debug!(
            "Structured call to {} used {} prompt / {} completion tokens",
            self.config.model_name, usage.prompt_tokens, usage.completion_tokens
        );

        Ok(StructuredCallResponse {
            value,
            usage: pricing::usage_for(
                &self.config.model_name,
                usage.prompt_tokens,
                usage.completion_tokens,
            ),
        })
    }
}

#[async_trait]
impl Service for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl LlmService for OpenAiCompatibleClient {
    async fn call_llm_structured(
        &self,
        request: StructuredCallRequest,
    ) -> Result<StructuredCallResponse, LlmError> {
        self.retry
            .execute(|| self.call_once(&request), |e: &LlmError| e.is_retryable())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_mode_blocks_real_client_construction() {
        std::env::set_var("MOCK_LLM", "1");
        let result = OpenAiCompatibleClient::new(OpenAiConfig {
            api_key: "sk-test".to_string(),
            ..OpenAiConfig::default()
        });
        std::env::remove_var("MOCK_LLM");
        assert!(matches!(result, Err(LlmError::MockModeViolation)));
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let result = OpenAiCompatibleClient::new(OpenAiConfig::default());
        assert!(matches!(result, Err(LlmError::Api(_))));
    }
}
