//! Watch-event dispatch
//!
//! Bridges `kube::runtime::watcher` streams into the per-kind work queues.
//! The update filter keeps reconcile storms out of the queues: an event is
//! enqueue-worthy only when the object is being deleted or its spec
//! generation is ahead of the last observed generation — the controller's
//! own status writes never re-trigger reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyway_common::crd::{DatabaseRole, DatabaseRoleBinding};

use crate::queue::{ObjectKey, WorkQueue};

/// Watcher timeout (seconds) - must be less than the client read timeout
/// so the API server closes idle watches before the client gives up.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Update filter for DatabaseRole events
pub fn role_needs_reconcile(role: &DatabaseRole) -> bool {
    if role.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let observed = role
        .status
        .as_ref()
        .map(|s| s.observed_generation)
        .unwrap_or(0);
    role.metadata.generation.unwrap_or(0) > observed
}

/// Update filter for DatabaseRoleBinding events
pub fn binding_needs_reconcile(binding: &DatabaseRoleBinding) -> bool {
    if binding.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let observed = binding
        .status
        .as_ref()
        .map(|s| s.observed_generation)
        .unwrap_or(0);
    binding.metadata.generation.unwrap_or(0) > observed
}

/// Drive one watch stream into a queue until shutdown.
///
/// Watcher errors are logged and the stream resumes on its own; they are
/// never fatal to the process.
pub async fn run_watch<K>(
    kind: &'static str,
    api: Api<K>,
    queue: Arc<WorkQueue>,
    filter: fn(&K) -> bool,
    shutdown: CancellationToken,
) where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    info!(kind = %kind, "watch started");
    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    let stream = watcher::watcher(api, config);
    futures::pin_mut!(stream);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind = %kind, "watch stopping");
                return;
            }
            event = stream.next() => event,
        };

        match event {
            Some(Ok(Event::Apply(obj))) | Some(Ok(Event::InitApply(obj))) => {
                if filter(&obj) {
                    let key = ObjectKey::from_resource(&obj);
                    debug!(kind = %kind, key = %key, "event enqueued");
                    queue.enqueue(key);
                }
            }
            Some(Ok(Event::Delete(obj))) => {
                // Finalized objects disappearing need no further work, but
                // the reconcile is cheap and handles races around forced
                // deletions.
                queue.enqueue(ObjectKey::from_resource(&obj));
            }
            Some(Ok(Event::Init | Event::InitDone)) => {}
            Some(Err(e)) => {
                warn!(kind = %kind, error = %e, "watch error, stream will resume");
            }
            None => {
                warn!(kind = %kind, "watch stream ended");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use keyway_common::crd::{DatabaseRoleBindingStatus, DatabaseRoleStatus, Phase};

    use crate::testutil::{sample_binding, sample_role};

    #[test]
    fn new_role_is_enqueue_worthy() {
        let role = sample_role(); // generation 1, no status
        assert!(role_needs_reconcile(&role));
    }

    #[test]
    fn synced_role_is_filtered_out() {
        let mut role = sample_role();
        role.status = Some(DatabaseRoleStatus {
            phase: Phase::Success,
            observed_generation: 1,
            conditions: vec![],
        });
        assert!(
            !role_needs_reconcile(&role),
            "own status writes must not re-trigger reconciliation"
        );
    }

    #[test]
    fn spec_change_is_enqueue_worthy() {
        let mut role = sample_role();
        role.metadata.generation = Some(2);
        role.status = Some(DatabaseRoleStatus {
            phase: Phase::Success,
            observed_generation: 1,
            conditions: vec![],
        });
        assert!(role_needs_reconcile(&role));
    }

    #[test]
    fn deleting_object_is_always_enqueue_worthy() {
        let mut role = sample_role();
        role.status = Some(DatabaseRoleStatus {
            phase: Phase::Success,
            observed_generation: 1,
            conditions: vec![],
        });
        role.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(role_needs_reconcile(&role));
    }

    #[test]
    fn binding_filter_mirrors_role_filter() {
        let mut binding = sample_binding();
        assert!(binding_needs_reconcile(&binding));

        binding.status = Some(DatabaseRoleBindingStatus {
            observed_generation: 1,
            phase: Phase::Success,
            ..Default::default()
        });
        assert!(!binding_needs_reconcile(&binding));

        binding.metadata.generation = Some(2);
        assert!(binding_needs_reconcile(&binding));
    }
}
