//! Unified error types for the dialectic engine

use thiserror::Error;

/// Unified error type for all dialectic operations
#[derive(Error, Debug)]
pub enum DialecticError {
    // Provider errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limit: {0}")]
    RateLimited(String),

    #[error("Provider request timed out after {0}s")]
    Timeout(u64),

    #[error("Context window exceeded: {0}")]
    ContextWindow(String),

    #[error("No response from provider")]
    NoResponse,

    // Lookup errors
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Project {0} not found")]
    ProjectNotFound(String),

    #[error("Provider details not found for model {0}")]
    ProviderNotFound(String),

    #[error("Seed prompt not found: {0}")]
    SeedPromptNotFound(String),

    #[error("Stage configuration error: {0}")]
    StageConfig(String),

    // Job errors
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to save contribution: {0}")]
    SaveFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Generation cancelled: {0}")]
    Cancelled(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl DialecticError {
    /// Whether a model that failed with this error may be attempted again.
    ///
    /// Only transient provider conditions are retryable. Everything else
    /// fails the model immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(_) | Self::RateLimited(_) | Self::Timeout(_) | Self::Storage(_)
        )
    }

    /// Stable code carried in failure notifications
    pub fn failure_code(&self) -> &'static str {
        match self {
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Timeout(_) => "PROVIDER_TIMEOUT",
            Self::ContextWindow(_) => "CONTEXT_WINDOW_ERROR",
            Self::NoResponse => "NO_RESPONSE",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Self::ProviderNotFound(_) => "PROVIDER_CONFIG_INVALID",
            Self::SeedPromptNotFound(_) => "INVALID_INITIAL_PROMPT",
            Self::StageConfig(_) => "STAGE_CONFIG_MISSING",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::SaveFailed(_) => "SAVE_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias using DialecticError
pub type Result<T> = std::result::Result<T, DialecticError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(DialecticError::Provider("502".into()).is_retryable());
        assert!(DialecticError::Timeout(30).is_retryable());
        assert!(DialecticError::RateLimited("429".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        assert!(!DialecticError::ContextWindow("too long".into()).is_retryable());
        assert!(!DialecticError::SaveFailed("disk".into()).is_retryable());
        assert!(!DialecticError::SessionNotFound("s-1".into()).is_retryable());
        assert!(!DialecticError::Cancelled("user".into()).is_retryable());
        assert!(!DialecticError::NoResponse.is_retryable());
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(
            DialecticError::ContextWindow("x".into()).failure_code(),
            "CONTEXT_WINDOW_ERROR"
        );
        assert_eq!(
            DialecticError::ProviderNotFound("m".into()).failure_code(),
            "PROVIDER_CONFIG_INVALID"
        );
        assert_eq!(DialecticError::Cancelled("x".into()).failure_code(), "CANCELLED");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = DialecticError::SessionNotFound("abc".into());
        assert_eq!(err.to_string(), "Session abc not found");
    }
}
