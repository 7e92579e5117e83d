//! Error types for the Provider Gateway (§4.5), partitioned into the
//! retryable/terminal halves the job error taxonomy (§7) expects.

use thiserror::Error;

/// Result type for Provider Gateway operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Provider Gateway errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Configuration error (missing API key, invalid settings).
    #[error("configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// Rate limited by the provider.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Authorization rejected by the provider.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Requested model does not exist for this provider.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Any other non-2xx response not covered above.
    #[error("api error: {0}")]
    Api(String),

    /// Response did not parse into the expected shape.
    #[error("parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// §4.5: "transient (network, 5xx, rate-limit) -> retriable ...
    /// malformed request / 4xx authorization -> terminal; model-not-found
    /// -> terminal."
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Network(_) | ProviderError::RateLimited(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_the_taxonomy() {
        assert!(ProviderError::Network("timeout".into()).is_retryable());
        assert!(ProviderError::RateLimited("429".into()).is_retryable());
        assert!(!ProviderError::Unauthorized("401".into()).is_retryable());
        assert!(!ProviderError::ModelNotFound("gpt-9".into()).is_retryable());
        assert!(!ProviderError::Config("missing key".into()).is_retryable());
    }
}
