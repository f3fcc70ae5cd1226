//! Error types for the Keyway operator
//!
//! Errors carry structured context (object names, backend endpoints,
//! condition reasons) so failures can be traced back to a specific
//! resource in production logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Keyway operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Namespaced name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.database.connectionUrl")
        field: Option<String>,
    },

    /// Secrets-engine backend error
    #[error("secrets engine error for {object}: {message}")]
    Engine {
        /// Namespaced name of the object being converged
        object: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Finalization error during asynchronous cleanup
    #[error("finalize error for {object}: {message}")]
    Finalize {
        /// Namespaced name of the object being finalized
        object: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "queue", "renewal")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a secrets-engine error with the given message
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a secrets-engine error with object context
    pub fn engine_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Engine {
            object: object.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable secrets-engine error (e.g. a rejected payload)
    pub fn engine_permanent(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Engine {
            object: object.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a finalize error with object context
    pub fn finalize_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Finalize {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a spec fix; the queue
    /// still retries them uniformly, but callers that can short-circuit
    /// (e.g. the renewal sweep) use this to skip hopeless work.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout).
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Engine { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Finalize { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the object name if this error is associated with a specific object
    pub fn object(&self) -> Option<&str> {
        match self {
            Error::Validation { object, .. } => Some(object),
            Error::Engine { object, .. } => Some(object),
            Error::Finalize { object, .. } => Some(object),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation("database config is required");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("validation error"));
    }

    #[test]
    fn validation_error_carries_object_and_field() {
        let err = Error::validation_for_field(
            "default/app-reader",
            "spec.database.connectionUrl",
            "missing {{username}} placeholder",
        );
        assert_eq!(err.object(), Some("default/app-reader"));
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.database.connectionUrl"));
            }
            _ => panic!("expected Validation variant"),
        }
    }

    #[test]
    fn engine_errors_are_retryable_by_default() {
        let err = Error::engine_for("default/app-reader", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.object(), Some("default/app-reader"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn permanent_engine_errors_are_not_retryable() {
        let err = Error::engine_permanent("default/app-reader", "unsupported plugin");
        assert!(!err.is_retryable());
    }

    #[test]
    fn serialization_errors_carry_kind() {
        let err = Error::serialization_for_kind("DatabaseRole", "missing field `spec`");
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("DatabaseRole"));
            }
            _ => panic!("expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn finalize_errors_are_retryable() {
        let err = Error::finalize_for("default/app-reader", "lease revocation failed");
        assert!(err.is_retryable());
        assert_eq!(err.object(), Some("default/app-reader"));
    }

    #[test]
    fn internal_error_formats_context() {
        let err = Error::internal_with_context("renewal", "lister unavailable");
        assert!(err.to_string().contains("[renewal]"));
        assert!(err.to_string().contains("lister unavailable"));

        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
    }

    #[test]
    fn error_constructors_accept_string_and_str() {
        let name = "prod/billing-writer";
        let err = Error::engine_for(name, format!("lease {} not found", "pg/creds/x"));
        assert!(err.to_string().contains("billing-writer"));

        let err = Error::validation("static message");
        assert!(err.to_string().contains("static message"));
    }
}
