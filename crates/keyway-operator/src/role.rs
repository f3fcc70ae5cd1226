//! DatabaseRole reconciliation
//!
//! Converges one DatabaseRole to the secrets backend. Two-state machine
//! keyed on `status.phase` and `observedGeneration`: the initial pass
//! mounts the engine, writes the connection configuration, and creates the
//! role definition; subsequent spec changes re-issue only the
//! role-definition write, because the backend's create call fully replaces
//! the prior definition.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use keyway_common::crd::{DatabaseRole, Phase, ProviderRef, SecretRef};
use keyway_common::{Error, Result, ROLE_FINALIZER};

use crate::context::Context;
use crate::engine;
use crate::finalizer::FinalizeTarget;
use crate::status::{record_role_failure, update_role_status};

/// True if the metadata carries the given finalizer token
pub(crate) fn has_finalizer(metadata: &ObjectMeta, token: &str) -> bool {
    metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|t| t == token))
        .unwrap_or(false)
}

/// Reconcile a DatabaseRole
#[instrument(skip(role, ctx), fields(role = %role.name_any()))]
pub async fn reconcile(role: Arc<DatabaseRole>, ctx: Arc<Context>) -> Result<()> {
    let namespace = role.namespace().unwrap_or_else(|| "default".to_string());
    let name = role.name_any();

    // Deletion is handled out-of-band by the finalizer coordinator so a
    // slow backend never blocks a queue worker.
    if role.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&role.metadata, ROLE_FINALIZER) {
            let key = format!("DatabaseRole/{namespace}/{name}");
            ctx.finalizers.spawn(
                key,
                Arc::new(RoleFinalizeTarget {
                    ctx: ctx.clone(),
                    namespace,
                    name,
                    provider: role.spec.provider.clone(),
                    backend_name: role.backend_name(),
                }),
            );
        }
        return Ok(());
    }

    if !has_finalizer(&role.metadata, ROLE_FINALIZER) {
        ctx.kube
            .add_role_finalizer(&namespace, &name, ROLE_FINALIZER)
            .await?;
    }

    let generation = role.metadata.generation.unwrap_or(0);
    let status = role.status.clone().unwrap_or_default();

    match status.phase {
        Phase::Pending => initial_sync(&role, &namespace, &name, generation, &ctx).await,
        Phase::Success if generation > status.observed_generation => {
            sync_role_definition(&role, &namespace, &name, generation, &ctx).await
        }
        Phase::Success => {
            debug!(role = %name, "generation unchanged, nothing to do");
            Ok(())
        }
    }
}

/// First-time convergence: mount, connection config, role definition.
///
/// Each step is idempotent/replacing, so a partial failure simply restarts
/// the sequence from the top on the next attempt — the phase only advances
/// once all three steps have succeeded.
async fn initial_sync(
    role: &DatabaseRole,
    namespace: &str,
    name: &str,
    generation: i64,
    ctx: &Context,
) -> Result<()> {
    info!(role = %name, engine = %role.spec.engine, "initial sync against secrets backend");

    let backend = ctx.engines.connect(namespace, &role.spec.provider).await?;
    let backend_name = role.backend_name();

    if let Err(e) = backend.enable_database_engine().await {
        record_role_failure(
            ctx.kube.as_ref(),
            namespace,
            name,
            "FailedToEnableDatabase",
            &e,
        )
        .await;
        return Err(e.into());
    }

    let (username, password) = match resolve_database_credentials(ctx, namespace, role).await {
        Ok(creds) => creds,
        Err(e) => {
            record_role_failure(
                ctx.kube.as_ref(),
                namespace,
                name,
                "FailedToCreateDatabaseConfig",
                &e,
            )
            .await;
            return Err(e);
        }
    };

    let connection = engine::connection_payload(&role.spec, &backend_name, &username, &password);
    if let Err(e) = backend
        .write_connection_config(&backend_name, &connection)
        .await
    {
        record_role_failure(
            ctx.kube.as_ref(),
            namespace,
            name,
            "FailedToCreateDatabaseConfig",
            &e,
        )
        .await;
        return Err(e.into());
    }

    if let Err(e) = backend
        .create_role(&backend_name, &engine::role_payload(&role.spec))
        .await
    {
        record_role_failure(ctx.kube.as_ref(), namespace, name, "FailedToCreateRole", &e).await;
        return Err(e.into());
    }

    update_role_status(ctx.kube.as_ref(), namespace, name, |status| {
        status.phase = Phase::Success;
        status.observed_generation = generation;
        status.conditions.clear();
    })
    .await?;

    info!(role = %name, "initial sync complete");
    Ok(())
}

/// Spec changed after the initial sync: re-issue only the role definition.
/// The connection configuration is not re-applied here.
async fn sync_role_definition(
    role: &DatabaseRole,
    namespace: &str,
    name: &str,
    generation: i64,
    ctx: &Context,
) -> Result<()> {
    info!(role = %name, generation, "syncing role definition after spec change");

    let backend = ctx.engines.connect(namespace, &role.spec.provider).await?;
    if let Err(e) = backend
        .create_role(&role.backend_name(), &engine::role_payload(&role.spec))
        .await
    {
        record_role_failure(ctx.kube.as_ref(), namespace, name, "FailedToUpdateRole", &e).await;
        return Err(e.into());
    }

    update_role_status(ctx.kube.as_ref(), namespace, name, |status| {
        status.observed_generation = generation;
        status.conditions.clear();
    })
    .await
}

/// Read the root credentials the backend uses to manage database users
async fn resolve_database_credentials(
    ctx: &Context,
    namespace: &str,
    role: &DatabaseRole,
) -> Result<(String, String)> {
    let secret_ref: &SecretRef = &role.spec.database.credentials_secret_ref;
    let secret_ns = secret_ref.namespace_or(namespace);
    let secret = ctx
        .kube
        .get_secret(secret_ns, &secret_ref.name)
        .await?
        .ok_or_else(|| {
            Error::validation_for_field(
                format!("{namespace}/{}", role.name_any()),
                "spec.database.credentialsSecretRef",
                format!("secret {secret_ns}/{} not found", secret_ref.name),
            )
        })?;

    let read_key = |key: &str| -> Option<String> {
        if let Some(data) = &secret.data {
            if let Some(bytes) = data.get(key) {
                return String::from_utf8(bytes.0.clone()).ok();
            }
        }
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(key))
            .cloned()
    };

    match (read_key("username"), read_key("password")) {
        (Some(username), Some(password)) => Ok((username, password)),
        _ => Err(Error::validation_for_field(
            format!("{namespace}/{}", role.name_any()),
            "spec.database.credentialsSecretRef",
            format!(
                "secret {secret_ns}/{} must contain `username` and `password` keys",
                secret_ref.name
            ),
        )),
    }
}

/// Cleanup capability for a deleting DatabaseRole
struct RoleFinalizeTarget {
    ctx: Arc<Context>,
    namespace: String,
    name: String,
    provider: ProviderRef,
    backend_name: String,
}

#[async_trait]
impl FinalizeTarget for RoleFinalizeTarget {
    fn describe(&self) -> String {
        format!("DatabaseRole {}/{}", self.namespace, self.name)
    }

    async fn still_present(&self) -> Result<bool> {
        Ok(self
            .ctx
            .kube
            .get_role(&self.namespace, &self.name)
            .await?
            .is_some())
    }

    async fn cleanup(&self) -> Result<()> {
        let backend = self
            .ctx
            .engines
            .connect(&self.namespace, &self.provider)
            .await?;
        backend
            .delete_role(&self.backend_name)
            .await
            .map_err(|e| Error::finalize_for(self.describe(), e.to_string()))
    }

    async fn remove_token(&self) -> Result<()> {
        self.ctx
            .kube
            .remove_role_finalizer(&self.namespace, &self.name, ROLE_FINALIZER)
            .await
    }
}
