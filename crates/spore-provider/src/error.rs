//! Error types for provider calls.

use thiserror::Error;

/// Result type alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors returned by a [`CloudProvider`](crate::CloudProvider).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider rejected the request.
    #[error("provider error {code}: {message}")]
    Api { code: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The request never produced a provider answer.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("fixture error: {0}")]
    Fixture(String),
}

impl ProviderError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Api {
            code: code.into(),
            message: message.into(),
        }
    }
}
