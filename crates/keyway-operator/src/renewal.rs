//! Background lease renewal
//!
//! One long-lived task per database family sweeps all live
//! DatabaseRoleBindings on a fixed interval and renews leases approaching
//! their deadline. The sweep runs independently of the reconcile queues and
//! never touches the finalizer in-flight set — it only writes the
//! `status.lease.renewDeadline` field.

use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyway_common::crd::{DatabaseEngine, DatabaseRoleBinding};

use crate::context::Context;
use crate::status::update_binding_status;

/// Spawn one renewal task per database family.
///
/// Tasks run until `shutdown` is cancelled.
pub fn spawn_renewal_tasks(
    ctx: &Arc<Context>,
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    DatabaseEngine::ALL
        .iter()
        .map(|family| {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let family = *family;
            tokio::spawn(async move {
                run(ctx, family, shutdown).await;
            })
        })
        .collect()
}

async fn run(ctx: Arc<Context>, family: DatabaseEngine, shutdown: CancellationToken) {
    info!(family = %family, "lease renewal task started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(family = %family, "lease renewal task stopping");
                return;
            }
            _ = tokio::time::sleep(ctx.config.renewal_interval) => {
                sweep(&ctx, family).await;
            }
        }
    }
}

/// One renewal pass over all live bindings of the given family.
///
/// Per-binding errors are logged and skipped; they never abort the sweep
/// for other bindings.
pub async fn sweep(ctx: &Context, family: DatabaseEngine) {
    let bindings = match ctx.kube.list_bindings().await {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!(family = %family, error = %e, "failed to list bindings for renewal sweep");
            return;
        }
    };

    let horizon =
        (ctx.config.renewal_interval + ctx.config.renewal_safety_margin).as_secs() as i64;

    for binding in bindings {
        if binding.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let Some(lease) = binding.lease().cloned() else {
            continue;
        };
        if let Err(e) = renew_binding(ctx, family, &binding, &lease, horizon).await {
            warn!(
                family = %family,
                binding = %binding.name_any(),
                lease = %lease.id,
                error = %e,
                "lease renewal failed"
            );
        }
    }
}

async fn renew_binding(
    ctx: &Context,
    family: DatabaseEngine,
    binding: &DatabaseRoleBinding,
    lease: &keyway_common::crd::LeaseData,
    horizon: i64,
) -> keyway_common::Result<()> {
    let namespace = binding.namespace().unwrap_or_else(|| "default".to_string());
    let name = binding.name_any();

    // The owning role carries both the family tag and the backend endpoint.
    let Some(role) = ctx.kube.get_role(&namespace, &binding.spec.role_ref).await? else {
        debug!(binding = %name, role = %binding.spec.role_ref, "owning role missing, skipping");
        return Ok(());
    };
    if role.spec.engine != family {
        return Ok(());
    }

    let now = Utc::now().timestamp();
    let remaining = lease.renew_deadline - now;
    if remaining > horizon {
        return Ok(());
    }

    let backend = ctx.engines.connect(&namespace, &role.spec.provider).await?;
    backend
        .renew_lease(&lease.id)
        .await
        .map_err(keyway_common::Error::from)?;

    update_binding_status(ctx.kube.as_ref(), &namespace, &name, |status| {
        status.lease.renew_deadline = Utc::now().timestamp();
    })
    .await?;

    info!(binding = %name, lease = %lease.id, "lease renewed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use keyway_common::crd::{DatabaseRoleBindingStatus, LeaseData, Phase};
    use keyway_common::Error;
    use keyway_vault::{EngineError, MockSecretsEngine, SecretsEngine};

    use crate::context::{ControllerConfig, MockEngineFactory};
    use crate::finalizer::FinalizerCoordinator;
    use crate::store::{MockCredentialStore, MockKubeClient};
    use crate::testutil::{sample_binding, sample_role};

    fn binding_with_lease(name: &str, lease_id: &str, renew_deadline: i64) -> DatabaseRoleBinding {
        let mut binding = sample_binding();
        binding.metadata.name = Some(name.to_string());
        binding.status = Some(DatabaseRoleBindingStatus {
            lease: LeaseData {
                id: lease_id.to_string(),
                duration: 300,
                renew_deadline,
            },
            observed_generation: 1,
            phase: Phase::Success,
            conditions: vec![],
        });
        binding
    }

    fn context_with(kube: MockKubeClient, backend: MockSecretsEngine) -> Context {
        let backend: Arc<dyn SecretsEngine> = Arc::new(backend);
        let mut engines = MockEngineFactory::new();
        engines
            .expect_connect()
            .returning(move |_, _| Ok(backend.clone()));
        Context {
            kube: Arc::new(kube),
            store: Arc::new(MockCredentialStore::new()),
            engines: Arc::new(engines),
            finalizers: FinalizerCoordinator::new(
                Duration::from_millis(2),
                Duration::from_secs(5),
            ),
            config: ControllerConfig::default(),
        }
    }

    #[tokio::test]
    async fn due_lease_is_renewed_and_deadline_advanced() {
        let stale = Utc::now().timestamp() - 120;
        let binding = binding_with_lease("app-readers", "L1", stale);

        let mut backend = MockSecretsEngine::new();
        backend
            .expect_renew_lease()
            .withf(|lease| lease == "L1")
            .times(1)
            .returning(|_| Ok(()));

        let mut kube = MockKubeClient::new();
        let listed = binding.clone();
        kube.expect_list_bindings()
            .returning(move || Ok(vec![listed.clone()]));
        let role = sample_role();
        kube.expect_get_role()
            .returning(move |_, _| Ok(Some(role.clone())));
        let stored = binding.clone();
        kube.expect_get_binding()
            .returning(move |_, _| Ok(Some(stored.clone())));
        let before = Utc::now().timestamp();
        kube.expect_patch_binding_status()
            .withf(move |_, _, status| {
                status.lease.renew_deadline >= before && status.lease.id == "L1"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = context_with(kube, backend);
        sweep(&ctx, DatabaseEngine::Postgres).await;
    }

    #[tokio::test]
    async fn other_family_bindings_are_skipped() {
        let stale = Utc::now().timestamp() - 120;
        let binding = binding_with_lease("app-readers", "L1", stale);

        let backend = MockSecretsEngine::new(); // renew_lease must not run

        let mut kube = MockKubeClient::new();
        let listed = binding.clone();
        kube.expect_list_bindings()
            .returning(move || Ok(vec![listed.clone()]));
        let role = sample_role(); // postgres role
        kube.expect_get_role()
            .returning(move |_, _| Ok(Some(role.clone())));

        let ctx = context_with(kube, backend);
        sweep(&ctx, DatabaseEngine::Mongodb).await;
    }

    #[tokio::test]
    async fn bindings_without_lease_are_skipped() {
        let binding = sample_binding(); // no status at all

        let backend = MockSecretsEngine::new();
        let mut kube = MockKubeClient::new();
        let listed = binding.clone();
        kube.expect_list_bindings()
            .returning(move || Ok(vec![listed.clone()]));
        // get_role must not be called for lease-less bindings.

        let ctx = context_with(kube, backend);
        sweep(&ctx, DatabaseEngine::Postgres).await;
    }

    #[tokio::test]
    async fn renewal_error_does_not_abort_sweep_for_others() {
        let stale = Utc::now().timestamp() - 120;
        let broken = binding_with_lease("broken", "L-bad", stale);
        let healthy = binding_with_lease("healthy", "L-good", stale);

        let mut backend = MockSecretsEngine::new();
        backend
            .expect_renew_lease()
            .withf(|lease| lease == "L-bad")
            .times(1)
            .returning(|_| {
                Err(EngineError::Api {
                    status: 400,
                    path: "sys/leases/renew".to_string(),
                    message: "lease not found".to_string(),
                })
            });
        backend
            .expect_renew_lease()
            .withf(|lease| lease == "L-good")
            .times(1)
            .returning(|_| Ok(()));

        let mut kube = MockKubeClient::new();
        let listed = vec![broken.clone(), healthy.clone()];
        kube.expect_list_bindings()
            .returning(move || Ok(listed.clone()));
        let role = sample_role();
        kube.expect_get_role()
            .returning(move |_, _| Ok(Some(role.clone())));
        let stored = healthy.clone();
        kube.expect_get_binding()
            .returning(move |_, _| Ok(Some(stored.clone())));
        kube.expect_patch_binding_status()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = context_with(kube, backend);
        sweep(&ctx, DatabaseEngine::Postgres).await;
    }

    #[tokio::test]
    async fn list_failure_is_tolerated() {
        let backend = MockSecretsEngine::new();
        let mut kube = MockKubeClient::new();
        kube.expect_list_bindings()
            .returning(|| Err(Error::internal("api server down")));

        let ctx = context_with(kube, backend);
        sweep(&ctx, DatabaseEngine::Postgres).await; // must not panic
    }

    #[tokio::test]
    async fn renewal_tasks_stop_on_shutdown() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_bindings().returning(|| Ok(vec![]));

        let ctx = Arc::new(context_with(kube, MockSecretsEngine::new()));
        let shutdown = CancellationToken::new();
        let handles = spawn_renewal_tasks(&ctx, &shutdown);
        assert_eq!(handles.len(), 3, "one task per database family");

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("task exits promptly")
                .unwrap();
        }
    }
}
