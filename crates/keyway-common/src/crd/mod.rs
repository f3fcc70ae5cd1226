//! Custom Resource Definitions for Keyway
//!
//! This module contains the DatabaseRole and DatabaseRoleBinding CRDs and
//! their shared supporting types.

mod database_role;
mod database_role_binding;
mod types;

pub use database_role::{DatabaseConnection, DatabaseRole, DatabaseRoleSpec, DatabaseRoleStatus};
pub use database_role_binding::{
    CredentialStoreSpec, DatabaseRoleBinding, DatabaseRoleBindingSpec, DatabaseRoleBindingStatus,
};
pub use types::{
    Condition, ConditionStatus, DatabaseEngine, LeaseData, Phase, ProviderRef, SecretRef, Subject,
};
