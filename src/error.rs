//! Error types for the billing engine.
//!
//! Validation errors are raised before any provider call is issued, so a
//! returned error never implies partial state. Recoverable payment outcomes
//! are not errors at all; see [`crate::outcome::RequiredAction`].

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The main error type for billing engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Malformed or contradictory input, e.g. combining a cancel with item changes.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing, negative, or zero-where-disallowed prepaid quantity options.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Customer, product, feature, or entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate entity, occupied slot, or concurrent operation in progress.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A deduction would overdraw a feature that rejects overage.
    #[error("Insufficient balance for feature '{0}'")]
    InsufficientBalance(String),

    /// The billing provider is not connected for this customer/org.
    #[error("Billing provider not configured: {0}")]
    ProviderConfigMissing(String),

    /// Unexpected provider-side failure (network, 5xx). Safe to retry.
    #[error("Provider error during '{operation}': {message}")]
    ProviderApi {
        operation: String,
        message: String,
        retryable: bool,
    },

    /// A provider call exceeded its bounded timeout. The slot lock has been
    /// released and the operation may be retried.
    #[error("Provider call '{operation}' timed out")]
    Timeout { operation: String },

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether retrying the operation may succeed without operator intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::ProviderApi { retryable, .. } => *retryable,
            Self::Conflict(_) => true,
            _ => false,
        }
    }

    /// Whether the error is the caller's fault (invalid input, missing records).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidOptions(_)
                | Self::NotFound(_)
                | Self::InsufficientBalance(_)
        )
    }

    pub(crate) fn provider(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderApi {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = EngineError::NotFound("customer cus_1".to_string());
        assert_eq!(err.to_string(), "Not found: customer cus_1");

        let err = EngineError::Timeout {
            operation: "update_subscription".to_string(),
        };
        assert_eq!(err.to_string(), "Provider call 'update_subscription' timed out");
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::Timeout { operation: "x".into() }.is_retryable());
        assert!(EngineError::Conflict("locked".into()).is_retryable());
        assert!(!EngineError::InvalidOptions("bad".into()).is_retryable());

        let api = EngineError::ProviderApi {
            operation: "create_subscription".into(),
            message: "503".into(),
            retryable: true,
        };
        assert!(api.is_retryable());
        assert!(!api.is_client_error());
    }
}
