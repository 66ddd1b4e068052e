//! Shared contracts for the agent fabric.
//!
//! Everything that crosses a crate boundary lives here: the service type and
//! priority enums, the typed service traits the buses dispatch through, the
//! request/response schemas, the error kinds, and the telemetry sink.

pub mod authority;
pub mod errors;
pub mod llm;
pub mod resources;
pub mod runtime_control;
pub mod services;
pub mod telemetry;
pub mod types;

pub use authority::*;
pub use errors::*;
pub use llm::*;
pub use resources::*;
pub use runtime_control::*;
pub use services::*;
pub use telemetry::*;
pub use types::*;
