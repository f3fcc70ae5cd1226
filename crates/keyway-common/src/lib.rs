//! Common types for Keyway: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Keyway CRDs
pub const API_GROUP: &str = "keyway.dev";

/// Finalizer token gating DatabaseRole deletion on backend role cleanup
pub const ROLE_FINALIZER: &str = "keyway.dev/role-cleanup";

/// Finalizer token gating DatabaseRoleBinding deletion on lease revocation
pub const BINDING_FINALIZER: &str = "keyway.dev/lease-revocation";

/// Secret data key holding the issued username
pub const SECRET_KEY_USERNAME: &str = "username";

/// Secret data key holding the issued password
pub const SECRET_KEY_PASSWORD: &str = "password";

/// Secret data key holding the lease identifier backing the credential
pub const SECRET_KEY_LEASE_ID: &str = "lease_id";

/// Field manager name used for all server-side apply patches
pub const FIELD_MANAGER: &str = "keyway-operator";
