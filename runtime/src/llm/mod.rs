//! LLM providers registered on the service fabric.

pub mod mock;
pub mod openai;
pub mod pricing;

pub use mock::MockLlmService;
pub use openai::{mock_mode_active, OpenAiCompatibleClient, OpenAiConfig};
