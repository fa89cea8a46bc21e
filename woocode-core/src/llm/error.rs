//! Error taxonomy for the provider layer
//!
//! Every surfaced variant names the provider involved, since the caller may
//! be mid-switch when a failure arrives. Malformed stream frames are not
//! represented here: they are logged and skipped where they occur and never
//! cross the provider boundary.

use std::time::Duration;

/// Errors surfaced by providers, the registry, and the session adapter.
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    /// A required credential, binary, or script is missing. Terminal for the
    /// provider, never fatal to the process.
    #[error("{provider}: missing configuration: {message}")]
    Configuration { provider: String, message: String },

    /// The provider's reachability check failed.
    #[error("{provider} is not reachable")]
    Unavailable { provider: String },

    /// No provider is registered under the requested id.
    #[error("unknown provider: {id}")]
    NotFound { id: String },

    /// A non-success transport result; the original body is preserved for
    /// diagnostics.
    #[error("{provider} request failed (status {status:?}): {message}")]
    Backend {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// A spawned local server did not become ready within the allowed
    /// window.
    #[error("{provider} did not become ready within {waited:?}")]
    StartupTimeout { provider: String, waited: Duration },

    /// Auto-detection exhausted every candidate.
    #[error("no provider available (tried: {})", tried.join(", "))]
    NoProviderAvailable { tried: Vec<String> },

    /// No provider was ever selected and the configured default is not
    /// registered.
    #[error("no active provider; default '{default_id}' is not registered")]
    NoActiveProvider { default_id: String },

    /// Connection-level failure before any HTTP status was obtained.
    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },
}

impl LLMError {
    pub fn backend(provider: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Backend {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }

    pub fn network(provider: &str, message: impl std::fmt::Display) -> Self {
        Self::Network {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    pub fn configuration(provider: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// The provider this error names, when it names one.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Configuration { provider, .. }
            | Self::Unavailable { provider }
            | Self::Backend { provider, .. }
            | Self::StartupTimeout { provider, .. }
            | Self::Network { provider, .. } => Some(provider),
            Self::NotFound { .. }
            | Self::NoProviderAvailable { .. }
            | Self::NoActiveProvider { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_mentions_provider_and_status() {
        let err = LLMError::backend("anthropic", Some(529), "overloaded");
        let text = err.to_string();
        assert!(text.contains("anthropic"));
        assert!(text.contains("529"));
        assert!(text.contains("overloaded"));
    }

    #[test]
    fn backend_error_without_status_still_formats() {
        let err = LLMError::backend("ollama", None, "connection reset");
        assert!(err.to_string().contains("None"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn exhausted_detection_lists_candidates() {
        let err = LLMError::NoProviderAvailable {
            tried: vec!["gemini".to_string(), "openai".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no provider available (tried: gemini, openai)"
        );
    }
}
