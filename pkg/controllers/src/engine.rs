use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pkg_constants::engine::{
    BACKOFF_BASE, BACKOFF_CAP, RECONCILE_TICK, WORKERS_PER_CONTROLLER,
};
use pkg_state::{Event, Store};
use pkg_types::Result;
use pkg_types::meta::{Condition, Kind, ResourceKey, set_condition};
use pkg_types::object::Object;

/// A control loop for one resource kind: a reconcile function that
/// compares observed and desired state for a single key, plus the
/// triggers that schedule it. Reconciles must be idempotent: safe to run
/// on an unchanged world.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Kind whose keys the periodic tick enqueues.
    fn kind(&self) -> Kind;

    /// Kinds whose store events wake this reconciler.
    fn watches(&self) -> Vec<Kind>;

    /// Map an observed event onto the keys that must reconcile.
    async fn keys_for(&self, event: &Event) -> Vec<ResourceKey>;

    /// Converge one object.
    async fn reconcile(&self, key: &ResourceKey) -> Result<()>;
}

// --- Work queue ---

/// Deduping per-key queue: at most one pending wakeup and at most one
/// in-flight reconcile per key, which is what enforces the
/// single-writer-per-object discipline.
struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<ResourceKey>,
    pending_set: HashSet<ResourceKey>,
    in_flight: HashSet<ResourceKey>,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    async fn enqueue(&self, key: ResourceKey) {
        let mut state = self.state.lock().await;
        if state.pending_set.insert(key.clone()) {
            state.pending.push(key);
            self.notify.notify_one();
        }
    }

    /// Pop the oldest pending key that is not already being reconciled,
    /// marking it in-flight.
    async fn next(&self) -> ResourceKey {
        loop {
            {
                let mut state = self.state.lock().await;
                let position = state
                    .pending
                    .iter()
                    .position(|k| !state.in_flight.contains(k));
                if let Some(position) = position {
                    let key = state.pending.remove(position);
                    state.pending_set.remove(&key);
                    state.in_flight.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn done(&self, key: &ResourceKey) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(key);
        // The key may have been re-enqueued while it was running.
        if state.pending_set.contains(key) {
            self.notify.notify_one();
        }
    }
}

/// Exponential retry delay: 1s, 2s, 4s, ... capped at 30s.
fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(5);
    let delay = BACKOFF_BASE * 2u32.saturating_pow(exponent);
    delay.min(BACKOFF_CAP)
}

// --- Engine ---

/// Multiplexes all controllers: per reconciler it runs one event pump per
/// watched kind, a periodic ticker over the primary kind's keys, and a
/// worker pool draining the per-key queue.
pub struct Engine {
    store: Store,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    tick: Duration,
}

impl Engine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            reconcilers: Vec::new(),
            tick: RECONCILE_TICK,
        }
    }

    /// Override the tick period (tests shorten it).
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn register(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    pub fn start(self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for reconciler in self.reconcilers {
            info!("starting controller {}", reconciler.name());
            handles.extend(spawn_controller(
                self.store.clone(),
                reconciler,
                self.tick,
                shutdown_rx.clone(),
            ));
        }
        EngineHandle {
            shutdown: shutdown_tx,
            handles,
        }
    }
}

/// Running engine. Dropping it does not stop the controllers; call
/// [`EngineHandle::shutdown`].
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal every controller task, then wait up to `grace` for in-flight
    /// reconciles to finish before abandoning them.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let handles = self.handles;
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!("engine shutdown grace expired; abandoning in-flight reconciles");
        }
    }
}

fn spawn_controller(
    store: Store,
    reconciler: Arc<dyn Reconciler>,
    tick: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(WorkQueue::new());
    let failures: Arc<Mutex<HashMap<ResourceKey, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut handles = Vec::new();

    for kind in reconciler.watches() {
        handles.push(tokio::spawn(event_pump(
            store.clone(),
            reconciler.clone(),
            kind,
            queue.clone(),
            shutdown.clone(),
        )));
    }
    handles.push(tokio::spawn(ticker(
        store.clone(),
        reconciler.clone(),
        tick,
        queue.clone(),
        shutdown.clone(),
    )));
    for _ in 0..WORKERS_PER_CONTROLLER {
        handles.push(tokio::spawn(worker(
            store.clone(),
            reconciler.clone(),
            queue.clone(),
            failures.clone(),
            shutdown.clone(),
        )));
    }
    handles
}

async fn event_pump(
    store: Store,
    reconciler: Arc<dyn Reconciler>,
    kind: Kind,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (initial, mut rx) = store.watch(kind).await;
    for event in initial {
        for key in reconciler.keys_for(&event).await {
            queue.enqueue(key).await;
        }
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    for key in reconciler.keys_for(&event).await {
                        queue.enqueue(key).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed events are unrecoverable per key; fall back to
                    // a full enumeration, which the tick would also do.
                    warn!(
                        "{}: {} watch lagged by {} events; re-enumerating",
                        reconciler.name(),
                        kind,
                        missed
                    );
                    for key in store.keys(reconciler.kind()).await {
                        queue.enqueue(key).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn ticker(
    store: Store,
    reconciler: Arc<dyn Reconciler>,
    tick: Duration,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                for key in store.keys(reconciler.kind()).await {
                    queue.enqueue(key).await;
                }
            }
        }
    }
}

async fn worker(
    store: Store,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    failures: Arc<Mutex<HashMap<ResourceKey, u32>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            _ = shutdown.changed() => break,
            key = queue.next() => key,
        };
        match reconciler.reconcile(&key).await {
            Ok(()) => {
                failures.lock().await.remove(&key);
                debug!("{}: reconciled {}", reconciler.name(), key);
            }
            Err(err) => {
                let attempt = {
                    let mut failures = failures.lock().await;
                    let count = failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let delay = backoff_delay(attempt);
                warn!(
                    "{}: reconcile of {} failed (attempt {}): {}; retrying in {:?}",
                    reconciler.name(),
                    key,
                    attempt,
                    err,
                    delay
                );
                if attempt >= 3 {
                    record_failure_condition(&store, &key, &err).await;
                }
                let queue = queue.clone();
                let requeue = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(requeue).await;
                });
            }
        }
        queue.done(&key).await;
    }
}

/// Surface a repeatedly failing reconcile in the object's status
/// conditions. Skips the write when the recorded condition already says
/// the same thing, so the resulting Updated event cannot hot-loop the
/// controller past its backoff.
async fn record_failure_condition(store: &Store, key: &ResourceKey, err: &pkg_types::Error) {
    let Ok(mut obj) = store.get(key).await else {
        return;
    };
    let message = err.to_string();
    let conditions = match &mut obj {
        Object::Pod(p) => &mut p.status.conditions,
        Object::ReplicaSet(rs) => &mut rs.status.conditions,
        Object::Service(s) => &mut s.status.conditions,
    };
    if conditions
        .iter()
        .any(|c| c.reason == "ReconcileError" && c.message == message)
    {
        return;
    }
    set_condition(conditions, Condition::new("ReconcileError", &message));
    let _ = store.update_status(obj).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::Error;
    use pkg_types::meta::ObjectMeta;
    use pkg_types::pod::{ContainerSpec, Pod, PodSpec};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_pod(name: &str) -> Pod {
        Pod {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta::named("default", name),
            spec: PodSpec {
                containers: vec![ContainerSpec {
                    name: "app".to_string(),
                    image: "nginx:alpine".to_string(),
                    env: StdHashMap::new(),
                }],
            },
            status: Default::default(),
        }
    }

    /// Counts reconciles per key; optionally fails the first N calls.
    struct CountingReconciler {
        total: AtomicU32,
        fail_first: u32,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
    }

    impl CountingReconciler {
        fn new(fail_first: u32) -> Self {
            Self {
                total: AtomicU32::new(0),
                fail_first,
                concurrent: AtomicU32::new(0),
                max_concurrent: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn kind(&self) -> Kind {
            Kind::Pod
        }

        fn watches(&self) -> Vec<Kind> {
            vec![Kind::Pod]
        }

        async fn keys_for(&self, event: &Event) -> Vec<ResourceKey> {
            vec![event.key()]
        }

        async fn reconcile(&self, _key: &ResourceKey) -> Result<()> {
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let attempt = self.total.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(Error::RuntimeTransient("injected".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn backoff_delays_grow_and_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn queue_dedupes_pending_keys() {
        let queue = WorkQueue::new();
        let key = ResourceKey::new(Kind::Pod, "default", "web");
        queue.enqueue(key.clone()).await;
        queue.enqueue(key.clone()).await;
        queue.enqueue(key.clone()).await;

        let first = queue.next().await;
        assert_eq!(first, key);
        let state = queue.state.lock().await;
        assert!(state.pending.is_empty(), "duplicates must collapse");
    }

    #[tokio::test]
    async fn queue_holds_key_while_in_flight() {
        let queue = Arc::new(WorkQueue::new());
        let key = ResourceKey::new(Kind::Pod, "default", "web");
        queue.enqueue(key.clone()).await;
        let taken = queue.next().await;
        assert_eq!(taken, key);

        // Re-enqueued while running: must not be handed out again yet.
        queue.enqueue(key.clone()).await;
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "key is still in flight");

        queue.done(&key).await;
        let again = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, key);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_reconciles_each_key_single_flight() {
        let store = Store::new();
        let reconciler = Arc::new(CountingReconciler::new(0));
        let handle = Engine::new(store.clone())
            .with_tick(Duration::from_millis(50))
            .register(reconciler.clone())
            .start();

        for i in 0..4 {
            store
                .create(make_pod(&format!("pod-{}", i)).into())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert!(reconciler.total.load(Ordering::SeqCst) >= 4);
        // Distinct keys may run in parallel, but never more workers than
        // the pool allows.
        assert!(
            reconciler.max_concurrent.load(Ordering::SeqCst) <= WORKERS_PER_CONTROLLER as u32
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_retries_failed_reconciles() {
        let store = Store::new();
        let reconciler = Arc::new(CountingReconciler::new(2));
        let handle = Engine::new(store.clone())
            .with_tick(Duration::from_secs(60)) // rely on events + backoff
            .register(reconciler.clone())
            .start();

        store.create(make_pod("web").into()).await.unwrap();

        // Two failures back off at 1s and 2s; give it room to succeed.
        tokio::time::sleep(Duration::from_millis(3600)).await;
        handle.shutdown(Duration::from_secs(1)).await;

        assert!(reconciler.total.load(Ordering::SeqCst) >= 3);
    }
}
