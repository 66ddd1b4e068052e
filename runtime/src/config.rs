//! Runtime configuration.
//!
//! A small serde struct with TOML overlay and env overrides. Full
//! configuration management lives outside the core; this covers only what
//! the fabric itself needs to boot.

use fabric_contracts::ResourceBudget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// LLM provider settings used by the env bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub key_dir: PathBuf,
    /// Force the mock LLM provider regardless of environment.
    pub mock_llm: bool,
    pub llm: LlmSettings,
    pub budget: ResourceBudget,
    /// Emergency kill-switch keys: WA id to base64 Ed25519 public key.
    pub emergency_keys: HashMap<String, String>,
    /// Bind address for the emergency endpoint.
    pub emergency_bind: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/fabric.db"),
            key_dir: PathBuf::from("data/keys"),
            mock_llm: false,
            llm: LlmSettings::default(),
            budget: ResourceBudget::default(),
            emergency_keys: HashMap::new(),
            emergency_bind: "127.0.0.1:8010".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file when present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.timeout_seconds, 30);
        assert!(!config.mock_llm);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let raw = r#"
            mock_llm = true

            [llm]
            model = "llama-3-70b"
        "#;
        let config: RuntimeConfig = toml::from_str(raw).unwrap();
        assert!(config.mock_llm);
        assert_eq!(config.llm.model, "llama-3-70b");
        assert_eq!(config.llm.timeout_seconds, 30);
        assert_eq!(config.db_path, PathBuf::from("data/fabric.db"));
    }
}
