//! Lifecycle coordination for the agent fabric.
//!
//! Phase-ordered initialization with verification, graceful and emergency
//! shutdown, and the resource monitor that turns threshold crossings into
//! protective signals.

pub mod initialization;
pub mod resource_monitor;
pub mod shutdown;

pub use initialization::*;
pub use resource_monitor::*;
pub use shutdown::*;
