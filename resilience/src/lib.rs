//! Fault-tolerance primitives for the service fabric.
//!
//! Circuit breakers isolate failing providers; the retry executor bounds
//! provider-level retries with exponential backoff.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::*;
pub use retry::*;
