//! Wise Authority subsystem: cryptographic identity, tokens, and deferrals.
//!
//! The authentication service owns the WA certificate store and the gateway
//! secret; the wise authority service implements authorization checks and
//! the deferral queue on top of it.

pub mod auth_service;
pub mod crypto;
pub mod store;
pub mod tasks;
pub mod wise_authority;

pub use auth_service::*;
pub use crypto::SecretStore;
pub use store::WaCertStore;
pub use tasks::TaskStore;
pub use wise_authority::*;
