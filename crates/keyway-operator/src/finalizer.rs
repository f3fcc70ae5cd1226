//! Finalizer-driven asynchronous cleanup
//!
//! When a watched object is marked for deletion, the dispatcher launches a
//! detached cleanup task here instead of blocking a queue worker. A
//! process-wide in-flight set guarantees at most one active finalization
//! per object identity, and an absolute timeout guarantees object deletion
//! is never blocked forever by an unreachable backend.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use keyway_common::Result;

/// Cleanup capability for one deleting object
#[async_trait]
pub trait FinalizeTarget: Send + Sync {
    /// Human-readable identity for logs (e.g. "DatabaseRole default/app")
    fn describe(&self) -> String;

    /// Re-fetch the object; false means deletion already completed
    async fn still_present(&self) -> Result<bool>;

    /// Perform the backend cleanup (delete role definition / revoke lease)
    async fn cleanup(&self) -> Result<()>;

    /// Remove the finalizer token so the storage layer can delete the object
    async fn remove_token(&self) -> Result<()>;
}

/// Runs bounded-retry cleanup tasks, deduplicated per object identity
pub struct FinalizerCoordinator {
    in_flight: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
    timeout: Duration,
}

impl FinalizerCoordinator {
    /// Create a coordinator with the given poll interval and absolute
    /// per-object timeout
    pub fn new(poll_interval: Duration, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            poll_interval,
            timeout,
        })
    }

    /// Launch a finalization task for `key` unless one is already running.
    ///
    /// Returns false (no-op) when the key is already in flight.
    pub fn spawn(&self, key: String, target: Arc<dyn FinalizeTarget>) -> bool {
        {
            let mut in_flight = self.in_flight.lock().expect("finalizer lock poisoned");
            if !in_flight.insert(key.clone()) {
                debug!(key = %key, "finalization already in flight");
                return false;
            }
        }

        let in_flight = self.in_flight.clone();
        let poll_interval = self.poll_interval;
        let timeout = self.timeout;
        tokio::spawn(async move {
            run_finalization(key, target, in_flight, poll_interval, timeout).await;
        });
        true
    }

    /// Number of finalizations currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("finalizer lock poisoned").len()
    }
}

/// Loop body of one finalization task: bounded by `timeout`, sleeping
/// `poll_interval` between attempts, clearing the in-flight marker on every
/// exit path
async fn run_finalization(
    key: String,
    target: Arc<dyn FinalizeTarget>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
    timeout: Duration,
) {
    let object = target.describe();
    let deadline = Instant::now() + timeout;
    let mut finalized = false;

    info!(object = %object, "starting finalization");

    loop {
        match target.still_present().await {
            Ok(false) => {
                debug!(object = %object, "object already gone, finalization complete");
                break;
            }
            Ok(true) => {}
            Err(e) => {
                warn!(object = %object, error = %e, "failed to re-fetch object during finalization");
            }
        }

        if finalized {
            match target.remove_token().await {
                Ok(()) => {
                    info!(object = %object, "finalizer removed");
                    break;
                }
                Err(e) if Instant::now() >= deadline => {
                    warn!(
                        object = %object,
                        error = %e,
                        "finalizer removal kept failing until timeout; giving up"
                    );
                    break;
                }
                Err(e) => {
                    warn!(object = %object, error = %e, "finalizer removal failed, will retry");
                }
            }
        } else if Instant::now() >= deadline {
            // Deliberate policy: object deletion must not block forever
            // on an unreachable backend. The leaked lease/role is left
            // for operators to hunt via this log line.
            warn!(
                object = %object,
                timeout_secs = timeout.as_secs(),
                "finalization timed out; force-removing finalizer, backend cleanup may be incomplete"
            );
            if let Err(e) = target.remove_token().await {
                warn!(object = %object, error = %e, "failed to force-remove finalizer");
            }
            break;
        } else {
            match target.cleanup().await {
                Ok(()) => {
                    finalized = true;
                    // Try to release the object right away; the loop
                    // retries removal if this attempt fails.
                    if target.remove_token().await.is_ok() {
                        info!(object = %object, "cleanup complete, finalizer removed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(object = %object, error = %e, "backend cleanup failed, will retry");
                }
            }
        }

        tokio::time::sleep(poll_interval).await;
    }

    in_flight
        .lock()
        .expect("finalizer lock poisoned")
        .remove(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use keyway_common::Error;

    #[derive(Default)]
    struct StubTarget {
        present: AtomicBool,
        cleanup_fails: AtomicBool,
        remove_fails: AtomicBool,
        cleanup_calls: AtomicU32,
        remove_calls: AtomicU32,
        block_cleanup: Option<Arc<tokio::sync::Notify>>,
    }

    impl StubTarget {
        fn present() -> Self {
            let target = Self::default();
            target.present.store(true, Ordering::SeqCst);
            target
        }
    }

    #[async_trait]
    impl FinalizeTarget for StubTarget {
        fn describe(&self) -> String {
            "DatabaseRole default/app-readonly".to_string()
        }

        async fn still_present(&self) -> Result<bool> {
            Ok(self.present.load(Ordering::SeqCst))
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.block_cleanup {
                gate.notified().await;
            }
            if self.cleanup_fails.load(Ordering::SeqCst) {
                Err(Error::engine("backend unreachable"))
            } else {
                Ok(())
            }
        }

        async fn remove_token(&self) -> Result<()> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            if self.remove_fails.load(Ordering::SeqCst) {
                Err(Error::engine("api server unavailable"))
            } else {
                Ok(())
            }
        }
    }

    async fn wait_until_idle(coordinator: &FinalizerCoordinator) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while coordinator.in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("finalization task should terminate");
    }

    #[tokio::test]
    async fn successful_cleanup_removes_finalizer_and_marker() {
        let coordinator =
            FinalizerCoordinator::new(Duration::from_millis(2), Duration::from_secs(5));
        let target = Arc::new(StubTarget::present());

        assert!(coordinator.spawn("DatabaseRole/default/app".to_string(), target.clone()));
        wait_until_idle(&coordinator).await;

        assert_eq!(target.cleanup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(target.remove_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_spawns_for_same_key_run_once() {
        let coordinator =
            FinalizerCoordinator::new(Duration::from_millis(2), Duration::from_secs(5));
        let gate = Arc::new(tokio::sync::Notify::new());
        let target = Arc::new(StubTarget {
            block_cleanup: Some(gate.clone()),
            ..StubTarget::present()
        });

        let key = "DatabaseRoleBinding/default/app-readers".to_string();
        assert!(coordinator.spawn(key.clone(), target.clone()));
        // Let the task reach cleanup so the key is firmly in flight.
        tokio::time::timeout(Duration::from_secs(1), async {
            while target.cleanup_calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        assert!(
            !coordinator.spawn(key.clone(), target.clone()),
            "second concurrent spawn is a no-op"
        );

        gate.notify_one();
        wait_until_idle(&coordinator).await;
        assert_eq!(target.cleanup_calls.load(Ordering::SeqCst), 1);

        // Once finished, the identity can be finalized again.
        target.present.store(false, Ordering::SeqCst);
        assert!(coordinator.spawn(key, target));
        wait_until_idle(&coordinator).await;
    }

    #[tokio::test]
    async fn timeout_escape_force_removes_finalizer() {
        let coordinator =
            FinalizerCoordinator::new(Duration::from_millis(3), Duration::from_millis(25));
        let target = Arc::new(StubTarget::present());
        target.cleanup_fails.store(true, Ordering::SeqCst);

        assert!(coordinator.spawn("DatabaseRole/default/app".to_string(), target.clone()));
        wait_until_idle(&coordinator).await;

        assert!(
            target.cleanup_calls.load(Ordering::SeqCst) >= 2,
            "cleanup retried before the timeout"
        );
        assert_eq!(
            target.remove_calls.load(Ordering::SeqCst),
            1,
            "finalizer force-removed despite failing cleanup"
        );
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn vanished_object_short_circuits() {
        let coordinator =
            FinalizerCoordinator::new(Duration::from_millis(2), Duration::from_secs(5));
        let target = Arc::new(StubTarget::default()); // present = false

        assert!(coordinator.spawn("DatabaseRole/default/gone".to_string(), target.clone()));
        wait_until_idle(&coordinator).await;

        assert_eq!(target.cleanup_calls.load(Ordering::SeqCst), 0);
        assert_eq!(target.remove_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_token_removal_retries_after_cleanup_success() {
        let coordinator =
            FinalizerCoordinator::new(Duration::from_millis(2), Duration::from_secs(5));
        let target = Arc::new(StubTarget::present());
        target.remove_fails.store(true, Ordering::SeqCst);

        assert!(coordinator.spawn("DatabaseRole/default/app".to_string(), target.clone()));

        // Wait for a few removal attempts, then let one succeed.
        tokio::time::timeout(Duration::from_secs(1), async {
            while target.remove_calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        target.remove_fails.store(false, Ordering::SeqCst);

        wait_until_idle(&coordinator).await;
        assert_eq!(
            target.cleanup_calls.load(Ordering::SeqCst),
            1,
            "cleanup is not repeated once it succeeded"
        );
    }
}
