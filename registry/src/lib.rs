//! Service registry with priority-based fallbacks and circuit breakers.
//!
//! Owns the mapping from [`ServiceType`] to ordered provider lists, enforces
//! the mock/real LLM mixing interlock, and selects providers under
//! capability, health, and breaker filters.

mod registry;

pub use registry::*;
