//! DatabaseRoleBinding reconciliation
//!
//! Guarantees a live, accessible credential exists for the binding's
//! subjects: check the recorded lease for liveness, mint a new credential
//! when it is absent or expired, materialize it as an owner-referenced
//! Secret, then (re)create the access-grant pair. Credential issuance is
//! the only step with real cost at the backend, so it completes and is
//! durably recorded before any grant is created — a grant never precedes
//! or outlives its backing secret.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use keyway_common::crd::{DatabaseRole, DatabaseRoleBinding, LeaseData, Phase};
use keyway_common::{Error, Result, BINDING_FINALIZER};
use keyway_vault::IssuedCredential;

use crate::context::Context;
use crate::finalizer::FinalizeTarget;
use crate::role::has_finalizer;
use crate::status::{record_binding_failure, update_binding_status};
use crate::store::{binding_owner_ref, lease_id_from_secret};

/// Reconcile a DatabaseRoleBinding
#[instrument(skip(binding, ctx), fields(binding = %binding.name_any()))]
pub async fn reconcile(binding: Arc<DatabaseRoleBinding>, ctx: Arc<Context>) -> Result<()> {
    let namespace = binding.namespace().unwrap_or_else(|| "default".to_string());
    let name = binding.name_any();

    if binding.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&binding.metadata, BINDING_FINALIZER) {
            let key = format!("DatabaseRoleBinding/{namespace}/{name}");
            ctx.finalizers.spawn(
                key,
                Arc::new(BindingFinalizeTarget {
                    ctx: ctx.clone(),
                    namespace,
                    name,
                }),
            );
        }
        return Ok(());
    }

    if !has_finalizer(&binding.metadata, BINDING_FINALIZER) {
        ctx.kube
            .add_binding_finalizer(&namespace, &name, BINDING_FINALIZER)
            .await?;
    }

    let role = ctx
        .kube
        .get_role(&namespace, &binding.spec.role_ref)
        .await?
        .ok_or_else(|| {
            Error::validation_for_field(
                format!("{namespace}/{name}"),
                "spec.roleRef",
                format!("DatabaseRole {} not found", binding.spec.role_ref),
            )
        })?;

    let backend = ctx.engines.connect(&namespace, &role.spec.provider).await?;
    let secret_name = binding.spec.store.secret.clone();

    // A missing secret simply means "no current lease"; a backend error
    // while checking liveness aborts the reconcile.
    let current_lease = match ctx.kube.get_secret(&namespace, &secret_name).await? {
        Some(secret) => lease_id_from_secret(&secret),
        None => None,
    };
    let lease_alive = match &current_lease {
        Some(lease_id) => {
            let expired = backend
                .is_lease_expired(lease_id)
                .await
                .map_err(|e| Error::engine_for(format!("{namespace}/{name}"), e.to_string()))?;
            if expired {
                debug!(binding = %name, lease = %lease_id, "recorded lease expired");
            }
            !expired
        }
        None => false,
    };

    let owner = binding_owner_ref(&binding)?;
    let generation = binding.metadata.generation.unwrap_or(0);

    let mut issued: Option<IssuedCredential> = None;
    if !lease_alive {
        let credential = match backend.issue_credential(&role.backend_name()).await {
            Ok(credential) => credential,
            Err(e) => {
                record_binding_failure(
                    ctx.kube.as_ref(),
                    &namespace,
                    &name,
                    "FailedToGetCredential",
                    &e,
                )
                .await;
                return Err(e.into());
            }
        };
        info!(
            binding = %name,
            lease = %credential.lease_id,
            duration = credential.lease_duration,
            "issued new credential"
        );

        if let Err(e) = ctx
            .store
            .create_credential_secret(&namespace, &secret_name, &credential, &owner)
            .await
        {
            // The lease exists at the backend but nothing durable points
            // at it; revoke so it cannot be orphaned.
            record_binding_failure(
                ctx.kube.as_ref(),
                &namespace,
                &name,
                "FailedToCreateSecret",
                &e,
            )
            .await;
            return match backend.revoke_lease(&credential.lease_id).await {
                Ok(()) => Err(e),
                Err(revoke_err) => {
                    warn!(
                        binding = %name,
                        lease = %credential.lease_id,
                        error = %revoke_err,
                        "failed to revoke lease after secret creation failure"
                    );
                    Err(Error::engine_for(
                        format!("{namespace}/{name}"),
                        format!("{e}; additionally failed to revoke lease {}: {revoke_err}", credential.lease_id),
                    ))
                }
            };
        }

        issued = Some(credential);
    }

    // Grants are refreshed on every reconcile regardless of lease state.
    let grant_name = binding.access_grant_name();
    if let Err(e) = ctx
        .store
        .create_access_role(&namespace, &grant_name, &secret_name, &owner)
        .await
    {
        record_binding_failure(ctx.kube.as_ref(), &namespace, &name, "FailedToCreateRole", &e)
            .await;
        return Err(e);
    }

    // A failure here deliberately leaves the freshly-issued lease alive:
    // the secret is already persisted, so the retry reuses it instead of
    // forcing a needless re-issue.
    if let Err(e) = ctx
        .store
        .create_access_grant(
            &namespace,
            &grant_name,
            &grant_name,
            &binding.spec.subjects,
            &owner,
        )
        .await
    {
        record_binding_failure(
            ctx.kube.as_ref(),
            &namespace,
            &name,
            "FailedToCreateRoleBinding",
            &e,
        )
        .await;
        return Err(e);
    }

    update_binding_status(ctx.kube.as_ref(), &namespace, &name, |status| {
        if let Some(credential) = issued {
            status.lease = LeaseData {
                id: credential.lease_id,
                duration: credential.lease_duration,
                renew_deadline: Utc::now().timestamp(),
            };
        }
        status.phase = Phase::Success;
        status.observed_generation = generation;
        status.conditions.clear();
    })
    .await?;

    debug!(binding = %name, "reconcile complete");
    Ok(())
}

/// Cleanup capability for a deleting DatabaseRoleBinding: revoke the
/// recorded lease
struct BindingFinalizeTarget {
    ctx: Arc<Context>,
    namespace: String,
    name: String,
}

impl BindingFinalizeTarget {
    async fn fetch(&self) -> Result<Option<DatabaseRoleBinding>> {
        self.ctx.kube.get_binding(&self.namespace, &self.name).await
    }

    async fn owning_role(&self, binding: &DatabaseRoleBinding) -> Result<DatabaseRole> {
        self.ctx
            .kube
            .get_role(&self.namespace, &binding.spec.role_ref)
            .await?
            .ok_or_else(|| {
                Error::finalize_for(
                    self.describe(),
                    format!(
                        "owning DatabaseRole {} no longer exists; cannot reach backend",
                        binding.spec.role_ref
                    ),
                )
            })
    }
}

#[async_trait]
impl FinalizeTarget for BindingFinalizeTarget {
    fn describe(&self) -> String {
        format!("DatabaseRoleBinding {}/{}", self.namespace, self.name)
    }

    async fn still_present(&self) -> Result<bool> {
        Ok(self.fetch().await?.is_some())
    }

    async fn cleanup(&self) -> Result<()> {
        let Some(binding) = self.fetch().await? else {
            return Ok(());
        };
        let Some(lease) = binding.lease().cloned() else {
            debug!(binding = %self.describe(), "no lease recorded, nothing to revoke");
            return Ok(());
        };

        let role = self.owning_role(&binding).await?;
        let backend = self
            .ctx
            .engines
            .connect(&self.namespace, &role.spec.provider)
            .await?;
        backend
            .revoke_lease(&lease.id)
            .await
            .map_err(|e| Error::finalize_for(self.describe(), e.to_string()))?;
        info!(binding = %self.describe(), lease = %lease.id, "lease revoked");
        Ok(())
    }

    async fn remove_token(&self) -> Result<()> {
        self.ctx
            .kube
            .remove_binding_finalizer(&self.namespace, &self.name, BINDING_FINALIZER)
            .await
    }
}
