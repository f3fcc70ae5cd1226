//! Secrets-engine client abstraction for Keyway
//!
//! The reconcilers talk to the dynamic-secrets backend exclusively through
//! the [`SecretsEngine`] trait so tests can mock the backend while
//! production uses the Vault HTTP implementation in [`http`].

use async_trait::async_trait;
use thiserror::Error;

pub mod http;

pub use http::VaultEngine;

/// Errors from the secrets-engine backend
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure (connection refused, timeout, TLS)
    #[error("engine request failed: {source}")]
    Http {
        /// The underlying reqwest error
        #[from]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status
    #[error("engine returned {status} for {path}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Request path, relative to the backend address
        path: String,
        /// Error body returned by the backend
        message: String,
    },

    /// The backend address could not be parsed
    #[error("invalid engine address: {0}")]
    Address(String),

    /// The backend answered 2xx but the body was not in the expected shape
    #[error("unexpected engine response for {path}: {message}")]
    Response {
        /// Request path, relative to the backend address
        path: String,
        /// What was missing or malformed
        message: String,
    },
}

impl EngineError {
    /// True for errors worth retrying (transport failures and 5xx)
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Http { .. } => true,
            EngineError::Api { status, .. } => *status >= 500,
            EngineError::Address(_) => false,
            EngineError::Response { .. } => false,
        }
    }
}

impl From<EngineError> for keyway_common::Error {
    fn from(err: EngineError) -> Self {
        if err.is_retryable() {
            keyway_common::Error::engine(err.to_string())
        } else {
            keyway_common::Error::engine_permanent(
                keyway_common::error::UNKNOWN_CONTEXT,
                err.to_string(),
            )
        }
    }
}

/// A credential issued by the backend, backed by a lease
#[derive(Clone, Debug, PartialEq)]
pub struct IssuedCredential {
    /// Opaque lease identifier
    pub lease_id: String,
    /// Lease duration in seconds
    pub lease_duration: i64,
    /// Whether the lease can be renewed
    pub renewable: bool,
    /// Issued database username
    pub username: String,
    /// Issued database password
    pub password: String,
}

/// Abstract capability set offered by the dynamic-secrets backend.
///
/// One instance is bound to a single mount path and bearer token; the
/// engine factory constructs an instance per provider reference.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait SecretsEngine: Send + Sync {
    /// Ensure the database secrets engine is mounted (idempotent
    /// check-then-mount; fails closed if the check itself errors)
    async fn enable_database_engine(&self) -> Result<(), EngineError>;

    /// Write the connection configuration for a database
    async fn write_connection_config(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Create or fully replace a role definition
    async fn create_role(&self, name: &str, payload: &serde_json::Value)
        -> Result<(), EngineError>;

    /// Delete a role definition; succeeds if the role is already absent
    async fn delete_role(&self, name: &str) -> Result<(), EngineError>;

    /// Issue a new leased credential for the given role
    async fn issue_credential(&self, role: &str) -> Result<IssuedCredential, EngineError>;

    /// Renew a lease
    async fn renew_lease(&self, lease_id: &str) -> Result<(), EngineError>;

    /// Revoke a lease
    async fn revoke_lease(&self, lease_id: &str) -> Result<(), EngineError>;

    /// Check whether a lease has expired or been revoked.
    ///
    /// "Lease not found" answers are reported as expired, not as errors;
    /// genuine backend failures are returned so callers can abort.
    async fn is_lease_expired(&self, lease_id: &str) -> Result<bool, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_server_errors_are_retryable() {
        let err = EngineError::Api {
            status: 503,
            path: "database/creds/app".to_string(),
            message: "sealed".to_string(),
        };
        assert!(err.is_retryable());

        let err = EngineError::Api {
            status: 400,
            path: "database/roles/app".to_string(),
            message: "invalid statements".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn conversion_preserves_retryability() {
        let transient: keyway_common::Error = EngineError::Api {
            status: 500,
            path: "sys/mounts".to_string(),
            message: "internal".to_string(),
        }
        .into();
        assert!(transient.is_retryable());

        let permanent: keyway_common::Error = EngineError::Address("not a url".to_string()).into();
        assert!(!permanent.is_retryable());
    }
}
