//! Error types for the Agent Fleet platform.
//!
//! The taxonomy distinguishes failures by who can act on them:
//! - [`FleetError::Configuration`]: a deployment's config is missing
//!   provider-required fields; raised before any network call.
//! - [`FleetError::Validation`]: a malformed or unsupported request.
//! - [`FleetError::Provider`]: a backend call failed; write paths propagate
//!   this, read paths substitute safe defaults.
//! - [`FleetError::NotFound`]: a referenced record does not exist.
//! - [`FleetError::Internal`]: unexpected internal failure.

use thiserror::Error;

/// Result alias used throughout the platform.
pub type FleetResult<T> = Result<T, FleetError>;

/// Platform error type.
#[derive(Debug, Error)]
pub enum FleetError {
    /// A deployment's declared config is missing provider-required fields.
    /// Raised locally, before any network call; never retried.
    #[error("configuration error for provider {provider}: missing required field(s): {}", .missing.join(", "))]
    Configuration {
        /// Provider the config was validated against.
        provider: String,
        /// Names of the missing fields.
        missing: Vec<String>,
    },

    /// An unsupported provider type or otherwise malformed request.
    #[error("validation error: {0}")]
    Validation(String),

    /// A backend call failed (network, auth, quota, timeout).
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Which backend failed.
        provider: String,
        /// Underlying failure description.
        message: String,
        /// HTTP status code, when the backend answered at all.
        status_code: Option<u16>,
        /// Whether retrying the same call may succeed.
        retryable: bool,
    },

    /// A referenced deployment or billing record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Create a configuration error naming the missing fields.
    pub fn configuration(
        provider: impl Into<String>,
        missing: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::Configuration {
            provider: provider.into(),
            missing: missing.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a provider error.
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this is a configuration or validation error (caller's fault,
    /// surfaced as a 4xx-equivalent).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_names_missing_fields() {
        let err = FleetError::configuration("kubernetes", ["image", "namespace"]);
        let message = err.to_string();
        assert!(message.contains("kubernetes"));
        assert!(message.contains("image"));
        assert!(message.contains("namespace"));
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn provider_error_retryability() {
        let err = FleetError::provider("aws-lambda", "throttled", Some(429), true);
        assert!(err.is_retryable());
        assert!(!err.is_client_error());

        let err = FleetError::provider("aws-lambda", "bad request", Some(400), false);
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_error_display() {
        let err = FleetError::validation("unsupported deployment type: heroku");
        assert_eq!(
            err.to_string(),
            "validation error: unsupported deployment type: heroku"
        );
    }
}
