//! Status write-back helpers
//!
//! All status mutations go through a read-modify-write cycle: fetch the
//! latest stored object, apply a pure mutator to a copy of its status, and
//! submit the full status value as a merge patch. Mutators are total — they
//! always produce a complete replacement status, never a partial delta.

use tracing::warn;

use keyway_common::crd::{Condition, DatabaseRoleBindingStatus, DatabaseRoleStatus};
use keyway_common::{Error, Result};

use crate::store::KubeClient;

/// Update a DatabaseRole's status against the latest stored version
pub async fn update_role_status<F>(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<()>
where
    F: FnOnce(&mut DatabaseRoleStatus) + Send,
{
    let role = kube.get_role(namespace, name).await?.ok_or_else(|| {
        Error::internal_with_context(
            "status",
            format!("DatabaseRole {namespace}/{name} vanished during status update"),
        )
    })?;
    let mut status = role.status.unwrap_or_default();
    mutate(&mut status);
    kube.patch_role_status(namespace, name, &status).await
}

/// Update a DatabaseRoleBinding's status against the latest stored version
pub async fn update_binding_status<F>(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<()>
where
    F: FnOnce(&mut DatabaseRoleBindingStatus) + Send,
{
    let binding = kube.get_binding(namespace, name).await?.ok_or_else(|| {
        Error::internal_with_context(
            "status",
            format!("DatabaseRoleBinding {namespace}/{name} vanished during status update"),
        )
    })?;
    let mut status = binding.status.unwrap_or_default();
    mutate(&mut status);
    kube.patch_binding_status(namespace, name, &status).await
}

/// Record a failed reconcile step on a DatabaseRole.
///
/// Persist failures are logged, not returned — the caller is already
/// propagating the original error and the condition will be rewritten on
/// the next attempt.
pub async fn record_role_failure(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    reason: &str,
    message: impl std::fmt::Display,
) {
    let condition = Condition::unavailable(reason, message.to_string());
    if let Err(e) = update_role_status(kube, namespace, name, |status| {
        status.conditions = vec![condition];
    })
    .await
    {
        warn!(
            role = %format!("{namespace}/{name}"),
            reason = %reason,
            error = %e,
            "failed to persist failure condition"
        );
    }
}

/// Record a failed reconcile step on a DatabaseRoleBinding
pub async fn record_binding_failure(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    reason: &str,
    message: impl std::fmt::Display,
) {
    let condition = Condition::unavailable(reason, message.to_string());
    if let Err(e) = update_binding_status(kube, namespace, name, |status| {
        status.conditions = vec![condition];
    })
    .await
    {
        warn!(
            binding = %format!("{namespace}/{name}"),
            reason = %reason,
            error = %e,
            "failed to persist failure condition"
        );
    }
}
