//! LLM request/response schemas and provider-level errors.

use serde::{Deserialize, Serialize};

/// A single chat message in a structured LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Request passed to an LLM provider for a structured call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredCallRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for StructuredCallRequest {
    fn default() -> Self {
        Self { messages: Vec::new(), max_tokens: 1024, temperature: 0.0 }
    }
}

/// Raw structured response from a provider: the JSON value plus metering.
///
/// The bus deserializes the value into the caller's response type.
#[derive(Debug, Clone)]
pub struct StructuredCallResponse {
    pub value: serde_json::Value,
    pub usage: ResourceUsage,
}

/// Token, cost, and environmental accounting for a single LLM call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tokens_used: u64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost_cents: f64,
    pub carbon_grams: f64,
    pub energy_kwh: f64,
    pub model_used: Option<String>,
}

/// Errors surfaced by LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("api error: {0}")]
    Api(String),

    #[error("invalid structured response: {0}")]
    InvalidResponse(String),

    #[error(
        "real LLM client constructed while mock mode is active; \
         refusing to mix simulated and real language models"
    )]
    MockModeViolation,
}

impl LlmError {
    /// Connection failures and rate limits are worth trying on another
    /// provider; timeouts fast-fail to avoid storm amplification.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Connection(_) | LlmError::RateLimited(_))
    }
}
