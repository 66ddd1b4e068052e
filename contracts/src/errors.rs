//! Cross-crate error kinds.

/// Errors from the authentication and wise-authority services.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl AuthorityError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        AuthorityError::NotFound { kind, id: id.into() }
    }
}
