use async_trait::async_trait;
use std::cmp::Ordering;
use tracing::{info, warn};
use uuid::Uuid;

use pkg_state::{Event, Store};
use pkg_types::meta::{Kind, ObjectMeta, OwnerReference, ResourceKey};
use pkg_types::object::Object;
use pkg_types::pod::{Pod, PodPhase};
use pkg_types::replicaset::ReplicaSet;
use pkg_types::selector;
use pkg_types::{Error, Result};

use crate::engine::Reconciler;

const NAME_COLLISION_RETRIES: usize = 5;

/// Reconciles the count of selector-matched pods against `spec.replicas`
/// and owns the pods it creates.
pub struct ReplicaSetController {
    store: Store,
}

impl ReplicaSetController {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// ReplicaSets a pod event may concern: its controller owner plus any
    /// set whose selector matches the pod's old or new labels.
    async fn owners_for_pod(&self, event: &Event) -> Vec<ResourceKey> {
        let mut keys = Vec::new();
        let mut push = |key: ResourceKey| {
            if !keys.contains(&key) {
                keys.push(key);
            }
        };

        let mut metas = vec![event.object().meta()];
        if let Event::Updated { old, .. } = event {
            metas.push(old.meta());
        }
        for meta in &metas {
            if let Some(owner) = meta.controller_owner()
                && owner.kind == Kind::ReplicaSet
            {
                push(ResourceKey::new(
                    Kind::ReplicaSet,
                    &meta.namespace,
                    &owner.name,
                ));
            }
        }

        let namespace = &event.object().meta().namespace;
        for rs in self.store.list(Kind::ReplicaSet, namespace, None).await {
            if let Object::ReplicaSet(rs) = rs {
                let matched = metas
                    .iter()
                    .any(|m| selector::matches(&rs.spec.selector, &m.labels));
                if matched {
                    push(rs.key());
                }
            }
        }
        keys
    }

    /// Cascade completion: children were marked by the store's delete
    /// sweep; once the pod manager has finalized them all, remove the set
    /// itself. Children created by an in-flight sync are marked here too.
    async fn finish_deletion(&self, rs: &ReplicaSet) -> Result<()> {
        let owned = self
            .store
            .list_owned(&rs.metadata.namespace, &rs.metadata.uid)
            .await;
        if owned.is_empty() {
            info!(
                "replicaset {}/{}: cascade complete",
                rs.metadata.namespace, rs.metadata.name
            );
            return self.store.finalize(&rs.key()).await;
        }
        for child in owned {
            if !child.meta().is_deleting() {
                match self.store.delete(&child.key()).await {
                    Ok(_) | Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    async fn sync(&self, rs: &ReplicaSet) -> Result<()> {
        let namespace = &rs.metadata.namespace;
        let owned: Vec<Pod> = self
            .store
            .list_owned(namespace, &rs.metadata.uid)
            .await
            .into_iter()
            .filter_map(Object::into_pod)
            .collect();

        // Partition: terminating pods still count as existing; terminal
        // pods are reaped so they provoke a replacement; live non-terminal
        // pods are the scale candidates. A pod that stopped matching the
        // selector is released, not deleted.
        let mut candidates: Vec<Pod> = Vec::new();
        let mut terminating = 0usize;
        for pod in owned {
            if pod.metadata.is_deleting() {
                if !pod.status.phase.is_terminal() {
                    terminating += 1;
                }
                continue;
            }
            if !selector::matches(&rs.spec.selector, &pod.metadata.labels) {
                self.release(rs, pod).await?;
                continue;
            }
            if pod.status.phase.is_terminal() {
                match self.store.delete(&pod.key()).await {
                    Ok(_) => info!(
                        "replicaset {}/{}: reaped {} pod {}",
                        namespace, rs.metadata.name, pod.status.phase, pod.metadata.name
                    ),
                    Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                continue;
            }
            candidates.push(pod);
        }

        let desired = rs.spec.replicas.max(0) as usize;
        let actual = candidates.len();

        if actual > desired {
            // Scale down live pods; pods already terminating finish on
            // their own.
            candidates.sort_by(deletion_order);
            for pod in candidates.iter().take(actual - desired) {
                match self.store.delete(&pod.key()).await {
                    Ok(_) => info!(
                        "replicaset {}/{}: scaled down pod {}",
                        namespace, rs.metadata.name, pod.metadata.name
                    ),
                    Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        } else if actual + terminating < desired {
            // Terminating pods still hold runtime resources; create only
            // what the eventual count is short of.
            for _ in 0..(desired - actual - terminating) {
                self.spawn_pod(rs).await?;
            }
        }

        self.refresh_status(rs).await
    }

    /// Clear this set's owner reference; the pod stays behind, unmanaged.
    async fn release(&self, rs: &ReplicaSet, mut pod: Pod) -> Result<()> {
        warn!(
            "replicaset {}/{}: releasing pod {} (labels no longer match)",
            rs.metadata.namespace, rs.metadata.name, pod.metadata.name
        );
        pod.metadata
            .owner_references
            .retain(|r| r.uid != rs.metadata.uid);
        match self.store.update(pod.into()).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn spawn_pod(&self, rs: &ReplicaSet) -> Result<()> {
        for _ in 0..NAME_COLLISION_RETRIES {
            let name = format!("{}-{}", rs.metadata.name, short_suffix());
            let mut metadata = ObjectMeta::named(&rs.metadata.namespace, &name);
            metadata.labels = rs.spec.template.metadata.labels.clone();
            metadata.owner_references = vec![OwnerReference {
                kind: Kind::ReplicaSet,
                name: rs.metadata.name.clone(),
                uid: rs.metadata.uid.clone(),
                controller: true,
            }];
            let pod = Pod {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                metadata,
                spec: rs.spec.template.spec.clone(),
                status: Default::default(),
            };
            match self.store.create(pod.into()).await {
                Ok(created) => {
                    info!(
                        "replicaset {}/{}: created pod {}",
                        rs.metadata.namespace,
                        rs.metadata.name,
                        created.meta().name
                    );
                    return Ok(());
                }
                Err(Error::AlreadyExists(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Internal(format!(
            "replicaset {}/{}: {} consecutive pod name collisions",
            rs.metadata.namespace, rs.metadata.name, NAME_COLLISION_RETRIES
        )))
    }

    /// Recount after mutations and write status only when it changed, so
    /// a no-op reconcile publishes no event.
    async fn refresh_status(&self, rs: &ReplicaSet) -> Result<()> {
        let owned: Vec<Pod> = self
            .store
            .list_owned(&rs.metadata.namespace, &rs.metadata.uid)
            .await
            .into_iter()
            .filter_map(Object::into_pod)
            .collect();
        let replicas = owned
            .iter()
            .filter(|p| !p.status.phase.is_terminal())
            .count() as i32;
        let ready = owned
            .iter()
            .filter(|p| !p.metadata.is_deleting() && p.status.phase == PodPhase::Running)
            .count() as i32;

        if rs.status.replicas != replicas || rs.status.ready_replicas != ready {
            let mut updated = rs.clone();
            updated.status.replicas = replicas;
            updated.status.ready_replicas = ready;
            match self.store.update_status(updated.into()).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Scale-down victim order: Pending before Running, then the most
/// recently created first, ties broken by name ascending.
fn deletion_order(a: &Pod, b: &Pod) -> Ordering {
    fn rank(pod: &Pod) -> u8 {
        if pod.status.phase == PodPhase::Pending { 0 } else { 1 }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| {
            b.metadata
                .creation_timestamp
                .cmp(&a.metadata.creation_timestamp)
        })
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..5].to_string()
}

#[async_trait]
impl Reconciler for ReplicaSetController {
    fn name(&self) -> &'static str {
        "replicaset"
    }

    fn kind(&self) -> Kind {
        Kind::ReplicaSet
    }

    fn watches(&self) -> Vec<Kind> {
        vec![Kind::ReplicaSet, Kind::Pod]
    }

    async fn keys_for(&self, event: &Event) -> Vec<ResourceKey> {
        match event.object() {
            Object::ReplicaSet(rs) => vec![rs.key()],
            Object::Pod(_) => self.owners_for_pod(event).await,
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<()> {
        let rs = match self.store.get(key).await {
            Ok(obj) => match obj.into_replicaset() {
                Some(rs) => rs,
                None => return Ok(()),
            },
            Err(Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if rs.metadata.is_deleting() {
            self.finish_deletion(&rs).await
        } else {
            self.sync(&rs).await
        }
    }
}
