//! Typed message buses for the agent fabric.
//!
//! Each bus is a façade over one [`fabric_contracts::ServiceType`]: it
//! selects providers through the registry, applies its own strategy
//! (failover chain, serialized single target, or broadcast), and meters the
//! calls it makes.

pub mod base;
pub mod llm;
pub mod runtime_control;
pub mod wise;

pub use base::*;
pub use llm::*;
pub use runtime_control::*;
pub use wise::*;
