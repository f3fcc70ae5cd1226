//! Composition root
//!
//! Wires the watch streams, per-kind work queues, worker pools, and the
//! lease-renewal tasks together, tied to one shutdown signal. Everything is
//! constructed once at startup and shared through the injected [`Context`].

use std::sync::Arc;

use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyway_common::crd::{DatabaseRole, DatabaseRoleBinding};
use keyway_common::Result;

use crate::context::{Context, ControllerConfig};
use crate::queue::{ObjectKey, ReconcileFn, WorkQueue};
use crate::{binding, renewal, role, watch};

/// Run the controller until a shutdown signal arrives.
///
/// Queue workers finish their current item before exiting; in-flight
/// finalization tasks run to their own timeout or completion.
pub async fn run(client: Client, config: ControllerConfig) -> Result<()> {
    let ctx = Arc::new(Context::builder(client.clone(), config.clone()).build());
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let role_queue = WorkQueue::new("database-role", config.max_retries);
    let binding_queue = WorkQueue::new("database-role-binding", config.max_retries);

    let roles: Api<DatabaseRole> = Api::all(client.clone());
    let bindings: Api<DatabaseRoleBinding> = Api::all(client);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(watch::run_watch(
        "DatabaseRole",
        roles,
        role_queue.clone(),
        watch::role_needs_reconcile,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(watch::run_watch(
        "DatabaseRoleBinding",
        bindings,
        binding_queue.clone(),
        watch::binding_needs_reconcile,
        shutdown.clone(),
    )));

    info!("- DatabaseRole controller");
    tasks.push(tokio::spawn(role_queue.run(
        config.workers,
        role_reconciler(ctx.clone()),
        shutdown.clone(),
    )));

    info!("- DatabaseRoleBinding controller");
    tasks.push(tokio::spawn(binding_queue.run(
        config.workers,
        binding_reconciler(ctx.clone()),
        shutdown.clone(),
    )));

    info!("- Lease renewal scheduler");
    tasks.extend(renewal::spawn_renewal_tasks(&ctx, &shutdown));

    info!(workers = config.workers, "keyway controller started");
    for task in tasks {
        let _ = task.await;
    }
    info!("keyway controller stopped");
    Ok(())
}

/// Reconcile driver for DatabaseRole keys: fetch the latest stored object
/// and converge it. A vanished object is a completed deletion.
fn role_reconciler(ctx: Arc<Context>) -> ReconcileFn {
    Arc::new(move |key: ObjectKey| {
        let ctx = ctx.clone();
        Box::pin(async move {
            match ctx.kube.get_role(&key.namespace, &key.name).await? {
                Some(role) => role::reconcile(Arc::new(role), ctx).await,
                None => {
                    debug!(key = %key, "DatabaseRole gone, nothing to reconcile");
                    Ok(())
                }
            }
        })
    })
}

/// Reconcile driver for DatabaseRoleBinding keys
fn binding_reconciler(ctx: Arc<Context>) -> ReconcileFn {
    Arc::new(move |key: ObjectKey| {
        let ctx = ctx.clone();
        Box::pin(async move {
            match ctx.kube.get_binding(&key.namespace, &key.name).await? {
                Some(obj) => binding::reconcile(Arc::new(obj), ctx).await,
                None => {
                    debug!(key = %key, "DatabaseRoleBinding gone, nothing to reconcile");
                    Ok(())
                }
            }
        })
    })
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sig) => sig,
                Err(e) => {
                    warn!(error = %e, "failed to listen for SIGTERM");
                    ctrl_c.await;
                    info!("shutdown signal received");
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        ctrl_c.await;

        info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use keyway_common::Error;

    use crate::context::MockEngineFactory;
    use crate::finalizer::FinalizerCoordinator;
    use crate::store::{MockCredentialStore, MockKubeClient};

    #[tokio::test]
    async fn vanished_key_reconciles_to_ok() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_role().returning(|_, _| Ok(None));

        let ctx = Arc::new(Context {
            kube: Arc::new(kube),
            store: Arc::new(MockCredentialStore::new()),
            engines: Arc::new(MockEngineFactory::new()),
            finalizers: FinalizerCoordinator::new(
                Duration::from_millis(2),
                Duration::from_secs(5),
            ),
            config: ControllerConfig::default(),
        });

        let reconcile = role_reconciler(ctx);
        reconcile(ObjectKey::new("default", "gone"))
            .await
            .expect("deleted object is not an error");
    }

    #[tokio::test]
    async fn fetch_errors_propagate_for_queue_retry() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_binding()
            .returning(|_, _| Err(Error::internal("api server down")));

        let ctx = Arc::new(Context {
            kube: Arc::new(kube),
            store: Arc::new(MockCredentialStore::new()),
            engines: Arc::new(MockEngineFactory::new()),
            finalizers: FinalizerCoordinator::new(
                Duration::from_millis(2),
                Duration::from_secs(5),
            ),
            config: ControllerConfig::default(),
        });

        let reconcile = binding_reconciler(ctx);
        assert!(reconcile(ObjectKey::new("default", "app")).await.is_err());
    }
}
