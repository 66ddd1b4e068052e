//! Runtime control: processor state, adapter management, configuration
//! snapshots, and the cryptographically authorized emergency stop.

pub mod emergency;
pub mod service;

pub use emergency::*;
pub use service::*;
