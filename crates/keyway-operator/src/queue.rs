//! Per-kind work queues
//!
//! Decouples watch notifications from reconciliation: events collapse into
//! one pending entry per object key, a fixed worker pool drains the queue,
//! and failed keys are re-delivered with capped, jittered backoff. At most
//! one worker processes a given key at any time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use keyway_common::retry::RetryConfig;
use keyway_common::Result;

/// Namespaced object identity used as the queue key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a watched resource
    pub fn from_resource<K: kube::ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reconcile function driven by the queue
pub type ReconcileFn = Arc<dyn Fn(ObjectKey) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct QueueState {
    /// Keys waiting for a worker, in arrival order
    pending: VecDeque<ObjectKey>,
    /// Mirror of `pending` for O(1) dedup
    queued: HashSet<ObjectKey>,
    /// Keys currently held by a worker
    active: HashSet<ObjectKey>,
    /// Keys that received an event while active; re-queued once released
    parked: HashSet<ObjectKey>,
    /// Consecutive failure count per key
    retries: HashMap<ObjectKey, u32>,
}

/// Deduplicating, retrying dispatch queue for one resource kind
pub struct WorkQueue {
    name: &'static str,
    max_retries: u32,
    retry: RetryConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create a queue with the default retry backoff
    pub fn new(name: &'static str, max_retries: u32) -> Arc<Self> {
        Self::with_retry_config(name, max_retries, RetryConfig::default())
    }

    /// Create a queue with a specific retry backoff (tests use tiny delays)
    pub fn with_retry_config(
        name: &'static str,
        max_retries: u32,
        retry: RetryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            max_retries,
            retry,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Add a key to the queue.
    ///
    /// Idempotent: a key already pending is not duplicated, and a key held
    /// by a worker is parked and re-queued exactly once when released.
    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.queued.contains(&key) || state.parked.contains(&key) {
            return;
        }
        if state.active.contains(&key) {
            state.parked.insert(key);
            return;
        }
        state.queued.insert(key.clone());
        state.pending.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").pending.len()
    }

    /// True if no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Option<ObjectKey> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let key = state.pending.pop_front()?;
        state.queued.remove(&key);
        state.active.insert(key.clone());
        Some(key)
    }

    fn finish(queue: &Arc<Self>, key: ObjectKey, result: Result<()>) {
        let mut state = queue.state.lock().expect("queue lock poisoned");
        state.active.remove(&key);

        match result {
            Ok(()) => {
                state.retries.remove(&key);
                if state.parked.remove(&key) {
                    state.queued.insert(key.clone());
                    state.pending.push_back(key);
                    drop(state);
                    queue.notify.notify_one();
                }
            }
            Err(err) => {
                // A retry already covers whatever event was parked.
                state.parked.remove(&key);
                let attempt = state.retries.get(&key).copied().unwrap_or(0) + 1;
                if attempt > queue.max_retries {
                    state.retries.remove(&key);
                    drop(state);
                    error!(
                        queue = queue.name,
                        key = %key,
                        error = %err,
                        retries = queue.max_retries,
                        "giving up on key after exhausting retries"
                    );
                    return;
                }
                state.retries.insert(key.clone(), attempt);
                drop(state);

                let delay = queue.retry.delay_for_attempt(attempt);
                warn!(
                    queue = queue.name,
                    key = %key,
                    error = %err,
                    attempt = attempt,
                    delay_ms = delay.as_millis(),
                    "reconcile failed, requeueing"
                );
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(key);
                });
            }
        }
    }

    /// Run `workers` parallel workers until `shutdown` is cancelled.
    ///
    /// Each worker pulls one key at a time and invokes `reconcile`; workers
    /// finish their current item before exiting.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        reconcile: ReconcileFn,
        shutdown: CancellationToken,
    ) {
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = self.clone();
            let reconcile = reconcile.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                queue.worker(worker_id, reconcile, shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        debug!(queue = self.name, "all workers stopped");
    }

    async fn worker(
        self: Arc<Self>,
        worker_id: usize,
        reconcile: ReconcileFn,
        shutdown: CancellationToken,
    ) {
        loop {
            let key = loop {
                if shutdown.is_cancelled() {
                    return;
                }
                if let Some(key) = self.take() {
                    break key;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = self.notify.notified() => {}
                }
            };

            debug!(queue = self.name, worker = worker_id, key = %key, "reconciling");
            let result = reconcile(key.clone()).await;
            Self::finish(&self, key, result);
        }
    }
}
