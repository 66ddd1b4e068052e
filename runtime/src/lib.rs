//! The agent fabric runtime: configuration, LLM providers, and the
//! long-running process that wires the registry, buses, lifecycle, and
//! authority services together.

pub mod config;
pub mod llm;
pub mod runtime;

pub use config::*;
pub use llm::*;
pub use runtime::*;
