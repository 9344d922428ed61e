use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use pkg_constants::engine::EVENT_CHANNEL_CAPACITY;
use pkg_types::meta::{Kind, ResourceKey};
use pkg_types::object::Object;
use pkg_types::{Error, Result};

use crate::watch::{Event, EventHub};

type ObjectMap = HashMap<ResourceKey, Object>;

/// Thread-safe in-memory repository of all resources, keyed by
/// (kind, namespace, name).
///
/// All mutations run under a single write guard and publish their events
/// before releasing it, so per-key event order equals commit order and an
/// observer can always read the state an event describes. All reads hand
/// out deep copies.
///
/// Deletion is deferred: `delete` only marks the object (and, under the
/// same guard, everything that owner-references it, recursively); the
/// finalizing controller calls `finalize` once runtime cleanup is done.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<ObjectMap>>,
    hub: Arc<EventHub>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            hub: Arc::new(EventHub::new(EVENT_CHANNEL_CAPACITY)),
        }
    }

    /// Insert a new resource. Assigns uid and creation timestamp, resets
    /// the server-managed status, and emits a Created event.
    pub async fn create(&self, mut obj: Object) -> Result<Object> {
        let key = obj.key();
        let mut map = self.inner.write().await;
        if map.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }

        let meta = obj.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        reset_status(&mut obj);

        if creates_cycle(&map, &obj) {
            return Err(Error::Validation(format!(
                "owner references of {} form a cycle",
                key
            )));
        }

        map.insert(key.clone(), obj.clone());
        debug!("store: created {}", key);
        self.hub.publish(Event::Created(obj.clone()));
        Ok(obj)
    }

    /// Deep copy of a resource, including deletion-marked ones (so a
    /// finalizing controller can still observe its object).
    pub async fn get(&self, key: &ResourceKey) -> Result<Object> {
        let map = self.inner.read().await;
        map.get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    /// Live (not deletion-marked) resources of a kind in a namespace,
    /// optionally filtered by the shared label-selector predicate.
    pub async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: Option<&HashMap<String, String>>,
    ) -> Vec<Object> {
        let map = self.inner.read().await;
        map.values()
            .filter(|o| o.kind() == kind && o.meta().namespace == namespace)
            .filter(|o| !o.meta().is_deleting())
            .filter(|o| match selector {
                Some(sel) => pkg_types::selector::matches(sel, &o.meta().labels),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Objects in a namespace holding an owner reference to `owner_uid`,
    /// including deletion-marked ones: a terminating child still exists
    /// for replica counting and cascade-completion checks.
    pub async fn list_owned(&self, namespace: &str, owner_uid: &str) -> Vec<Object> {
        let map = self.inner.read().await;
        map.values()
            .filter(|o| o.meta().namespace == namespace)
            .filter(|o| {
                o.meta()
                    .owner_references
                    .iter()
                    .any(|r| r.uid == owner_uid)
            })
            .cloned()
            .collect()
    }

    /// Every key of a kind, including deletion-marked objects. This is the
    /// engine's tick feed; it must reach objects that are mid-finalize.
    pub async fn keys(&self, kind: Kind) -> Vec<ResourceKey> {
        let map = self.inner.read().await;
        map.values()
            .filter(|o| o.kind() == kind)
            .map(|o| o.key())
            .collect()
    }

    /// Replace the desired state of an existing resource: `spec`,
    /// `metadata.labels`, and `metadata.ownerReferences`. The uid,
    /// creation timestamp, and server-managed status are preserved.
    pub async fn update(&self, obj: Object) -> Result<Object> {
        let key = obj.key();
        let mut map = self.inner.write().await;
        let Some(existing) = map.get(&key) else {
            return Err(Error::NotFound(key));
        };
        if existing.meta().is_deleting() {
            return Err(Error::NotFound(key));
        }
        let old = existing.clone();

        let mut stored = old.clone();
        merge_desired(&mut stored, obj)?;
        if creates_cycle(&map, &stored) {
            return Err(Error::Validation(format!(
                "owner references of {} form a cycle",
                key
            )));
        }

        map.insert(key.clone(), stored.clone());
        debug!("store: updated {}", key);
        self.hub.publish(Event::Updated {
            old,
            new: stored.clone(),
        });
        Ok(stored)
    }

    /// Controller-only path: replace the server-managed status, leaving
    /// desired state untouched.
    pub async fn update_status(&self, obj: Object) -> Result<Object> {
        let key = obj.key();
        let mut map = self.inner.write().await;
        let Some(existing) = map.get(&key) else {
            return Err(Error::NotFound(key));
        };
        let old = existing.clone();

        let mut stored = old.clone();
        merge_status(&mut stored, obj)?;

        map.insert(key.clone(), stored.clone());
        self.hub.publish(Event::Updated {
            old,
            new: stored.clone(),
        });
        Ok(stored)
    }

    /// Mark a resource deleted and emit a Deleted event, then sweep: every
    /// object owner-referencing it is marked too, recursively, under the
    /// same write guard. Physical removal happens in `finalize`.
    ///
    /// A second delete of an already-marked object reports NotFound.
    pub async fn delete(&self, key: &ResourceKey) -> Result<Object> {
        let mut map = self.inner.write().await;
        let Some(obj) = map.get_mut(key) else {
            return Err(Error::NotFound(key.clone()));
        };
        if obj.meta().is_deleting() {
            return Err(Error::NotFound(key.clone()));
        }

        obj.meta_mut().deletion_timestamp = Some(Utc::now());
        let snapshot = obj.clone();
        debug!("store: marked {} deleted", key);
        self.hub.publish(Event::Deleted(snapshot.clone()));
        self.cascade_mark(&mut map, &snapshot.meta().uid);
        Ok(snapshot)
    }

    /// Physically remove a deletion-marked resource once its finalizing
    /// controller confirmed cleanup. Emits a second Deleted event so
    /// owners waiting for their children to vanish converge without a
    /// tick. Idempotent: an absent key is success.
    pub async fn finalize(&self, key: &ResourceKey) -> Result<()> {
        let mut map = self.inner.write().await;
        let Some(existing) = map.get(key) else {
            return Ok(());
        };
        if !existing.meta().is_deleting() {
            return Err(Error::Internal(format!(
                "finalize called on live object {}",
                key
            )));
        }
        if let Some(obj) = map.remove(key) {
            debug!("store: finalized {}", key);
            self.hub.publish(Event::Deleted(obj));
        }
        Ok(())
    }

    /// Subscribe to a kind's change feed. Returns a synthetic Created
    /// event for every existing object of that kind (the initial list)
    /// plus the live receiver. Taken under the read guard, so no event can
    /// slip between the snapshot and the subscription.
    pub async fn watch(&self, kind: Kind) -> (Vec<Event>, tokio::sync::broadcast::Receiver<Event>) {
        let map = self.inner.read().await;
        let rx = self.hub.subscribe(kind);
        let initial = map
            .values()
            .filter(|o| o.kind() == kind)
            .map(|o| Event::Created(o.clone()))
            .collect();
        (initial, rx)
    }

    fn cascade_mark(&self, map: &mut ObjectMap, root_uid: &str) {
        let mut stack = vec![root_uid.to_string()];
        while let Some(uid) = stack.pop() {
            let children: Vec<ResourceKey> = map
                .values()
                .filter(|o| {
                    !o.meta().is_deleting()
                        && o.meta().owner_references.iter().any(|r| r.uid == uid)
                })
                .map(|o| o.key())
                .collect();
            for child_key in children {
                if let Some(child) = map.get_mut(&child_key) {
                    child.meta_mut().deletion_timestamp = Some(Utc::now());
                    let snapshot = child.clone();
                    debug!("store: cascade-marked {} deleted", child_key);
                    stack.push(snapshot.meta().uid.clone());
                    self.hub.publish(Event::Deleted(snapshot));
                }
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Carry the caller's desired state into the stored copy.
fn merge_desired(stored: &mut Object, incoming: Object) -> Result<()> {
    match (stored, incoming) {
        (Object::Pod(cur), Object::Pod(new)) => {
            cur.spec = new.spec;
            cur.metadata.labels = new.metadata.labels;
            cur.metadata.owner_references = new.metadata.owner_references;
        }
        (Object::ReplicaSet(cur), Object::ReplicaSet(new)) => {
            cur.spec = new.spec;
            cur.metadata.labels = new.metadata.labels;
            cur.metadata.owner_references = new.metadata.owner_references;
        }
        (Object::Service(cur), Object::Service(new)) => {
            cur.spec = new.spec;
            cur.metadata.labels = new.metadata.labels;
            cur.metadata.owner_references = new.metadata.owner_references;
        }
        (stored, incoming) => {
            return Err(Error::Internal(format!(
                "kind mismatch updating {}: stored {} incoming {}",
                stored.key(),
                stored.kind(),
                incoming.kind()
            )));
        }
    }
    Ok(())
}

fn merge_status(stored: &mut Object, incoming: Object) -> Result<()> {
    match (stored, incoming) {
        (Object::Pod(cur), Object::Pod(new)) => cur.status = new.status,
        (Object::ReplicaSet(cur), Object::ReplicaSet(new)) => cur.status = new.status,
        (Object::Service(cur), Object::Service(new)) => cur.status = new.status,
        (stored, incoming) => {
            return Err(Error::Internal(format!(
                "kind mismatch updating status of {}: stored {} incoming {}",
                stored.key(),
                stored.kind(),
                incoming.kind()
            )));
        }
    }
    Ok(())
}

fn reset_status(obj: &mut Object) {
    match obj {
        Object::Pod(p) => p.status = Default::default(),
        Object::ReplicaSet(rs) => rs.status = Default::default(),
        Object::Service(s) => s.status = Default::default(),
    }
}

/// Walk the owner chain by uid; the write is rejected when the object is
/// its own ancestor.
fn creates_cycle(map: &ObjectMap, obj: &Object) -> bool {
    let self_uid = &obj.meta().uid;
    let mut stack: Vec<String> = obj
        .meta()
        .owner_references
        .iter()
        .map(|r| r.uid.clone())
        .collect();
    let mut visited = HashSet::new();
    while let Some(uid) = stack.pop() {
        if uid == *self_uid {
            return true;
        }
        if !visited.insert(uid.clone()) {
            continue;
        }
        if let Some(owner) = map.values().find(|o| o.meta().uid == uid) {
            stack.extend(
                owner
                    .meta()
                    .owner_references
                    .iter()
                    .map(|r| r.uid.clone()),
            );
        }
    }
    false
}
