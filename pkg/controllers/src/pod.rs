use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use pkg_constants::runtime::{LABEL_NAMESPACE, LABEL_POD, pod_container_name};
use pkg_runtime::{ContainerState, RunSpec, RuntimeAdapter, RuntimeError};
use pkg_state::{Event, Store};
use pkg_types::meta::{Condition, Kind, ResourceKey, set_condition};
use pkg_types::pod::{Pod, PodPhase};
use pkg_types::{Error, Result};

use crate::engine::Reconciler;

/// Drives each Pod through its phase machine: Pending pods get a
/// container, Running pods are inspected for drift, deleted pods have
/// their container removed before the store entry is finalized.
pub struct PodLifecycleManager {
    store: Store,
    runtime: Arc<dyn RuntimeAdapter>,
}

impl PodLifecycleManager {
    pub fn new(store: Store, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self { store, runtime }
    }

    /// Pending → Running (or Failed): create the runtime container.
    async fn start(&self, mut pod: Pod) -> Result<()> {
        if !pod.status.container_id.is_empty() {
            return self.observe(pod).await;
        }
        let network = self.runtime.ensure_network().await?;
        let container = pod.container().clone();
        let name = pod_container_name(&pod.metadata.namespace, &pod.metadata.name);

        // Env verbatim; labels echo the pod's plus the orchestrator tags
        // so external tooling can inventory orchestrator-owned containers.
        let mut labels = pod.metadata.labels.clone();
        labels.insert(LABEL_POD.to_string(), pod.metadata.name.clone());
        labels.insert(LABEL_NAMESPACE.to_string(), pod.metadata.namespace.clone());

        let spec = RunSpec {
            name: name.clone(),
            image: container.image.clone(),
            env: container.env.clone(),
            labels,
            network,
        };
        match self.runtime.run_container(spec).await {
            Ok(running) => {
                info!(
                    "pod {}/{}: container {} running at {}",
                    pod.metadata.namespace, pod.metadata.name, running.id, running.ip
                );
                pod.status.phase = PodPhase::Running;
                pod.status.container_id = running.id;
                pod.status.pod_ip = running.ip;
                self.store.update_status(pod.into()).await?;
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                warn!(
                    "pod {}/{}: {}",
                    pod.metadata.namespace, pod.metadata.name, err
                );
                pod.status.phase = PodPhase::Failed;
                set_condition(
                    &mut pod.status.conditions,
                    Condition::new("ImagePullFailed", &err.to_string()),
                );
                self.store.update_status(pod.into()).await?;
                // Terminal for this pod; a controller may create a new one.
                Ok(())
            }
            Err(RuntimeError::NameConflict(_)) => {
                // A stale container holds our name; clear it and let the
                // engine's backoff retry the start.
                self.runtime.stop_and_remove(&name).await?;
                Err(Error::RuntimeTransient(format!(
                    "removed stale container {}; retrying start",
                    name
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Periodic inspection of a Running pod; detects exits and drift.
    async fn observe(&self, mut pod: Pod) -> Result<()> {
        let observed = match self.runtime.inspect(&pod.status.container_id).await? {
            ContainerState::Running => return Ok(()),
            ContainerState::Exited(0) => (PodPhase::Succeeded, None),
            ContainerState::Exited(code) => (
                PodPhase::Failed,
                Some(Condition::new(
                    "ContainerExited",
                    &format!("container exited with code {}", code),
                )),
            ),
            ContainerState::Missing => (
                PodPhase::Failed,
                Some(Condition::new(
                    "ContainerDisappeared",
                    "runtime no longer reports the container",
                )),
            ),
        };
        let (phase, condition) = observed;
        warn!(
            "pod {}/{}: {} → {}",
            pod.metadata.namespace, pod.metadata.name, pod.status.phase, phase
        );
        pod.status.phase = phase;
        if let Some(condition) = condition {
            set_condition(&mut pod.status.conditions, condition);
        }
        self.store.update_status(pod.into()).await?;
        Ok(())
    }

    /// Remove the runtime container, then the store entry. Idempotent
    /// against concurrent cascade sweeps: a missing container and a
    /// missing store entry are both success.
    async fn terminate(&self, pod: Pod) -> Result<()> {
        let target = if pod.status.container_id.is_empty() {
            // Never committed an id; remove by the conventional name in
            // case the start raced the deletion.
            pod_container_name(&pod.metadata.namespace, &pod.metadata.name)
        } else {
            pod.status.container_id.clone()
        };
        self.runtime.stop_and_remove(&target).await?;
        info!(
            "pod {}/{}: terminated",
            pod.metadata.namespace, pod.metadata.name
        );
        self.store.finalize(&pod.key()).await
    }
}

#[async_trait]
impl Reconciler for PodLifecycleManager {
    fn name(&self) -> &'static str {
        "pod-lifecycle"
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

    async fn reconcile(&self, key: &ResourceKey) -> Result<()> {
        let pod = match self.store.get(key).await {
            Ok(obj) => match obj.into_pod() {
                Some(pod) => pod,
                None => return Ok(()),
            },
            Err(Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        if pod.metadata.is_deleting() {
            return self.terminate(pod).await;
        }
        match pod.status.phase {
            PodPhase::Pending => self.start(pod).await,
            PodPhase::Running => self.observe(pod).await,
            // Terminal phases: no further runtime interaction.
            PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_runtime::FakeRuntime;
    use pkg_types::meta::ObjectMeta;
    use pkg_types::pod::{ContainerSpec, PodSpec};
    use std::collections::HashMap;

    fn make_pod(name: &str, image: &str) -> Pod {
        Pod {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta::named("default", name),
            spec: PodSpec {
                containers: vec![ContainerSpec {
                    name: "app".to_string(),
                    image: image.to_string(),
                    env: [("PORT".to_string(), "5000".to_string())].into_iter().collect(),
                }],
            },
            status: Default::default(),
        }
    }

    async fn setup() -> (Store, Arc<FakeRuntime>, PodLifecycleManager) {
        let store = Store::new();
        let runtime = Arc::new(FakeRuntime::new());
        let manager = PodLifecycleManager::new(store.clone(), runtime.clone());
        (store, runtime, manager)
    }

    async fn stored_pod(store: &Store, name: &str) -> Pod {
        store
            .get(&ResourceKey::new(Kind::Pod, "default", name))
            .await
            .unwrap()
            .into_pod()
            .unwrap()
    }

    #[tokio::test]
    async fn pending_pod_becomes_running() {
        let (store, runtime, manager) = setup().await;
        let created = store
            .create(make_pod("web", "nginx:alpine").into())
            .await
            .unwrap();

        manager.reconcile(&created.key()).await.unwrap();

        let pod = stored_pod(&store, "web").await;
        assert_eq!(pod.status.phase, PodPhase::Running);
        assert!(!pod.status.container_id.is_empty());
        assert!(!pod.status.pod_ip.is_empty());

        let container = runtime.container(&pod.status.container_id).unwrap();
        assert_eq!(container.name, "default-web");
        assert_eq!(container.env.get("PORT").map(String::as_str), Some("5000"));
        assert_eq!(
            container.labels.get(LABEL_POD).map(String::as_str),
            Some("web")
        );
        assert_eq!(
            container.labels.get(LABEL_NAMESPACE).map(String::as_str),
            Some("default")
        );
    }

    #[tokio::test]
    async fn image_pull_failure_is_terminal() {
        let (store, runtime, manager) = setup().await;
        runtime.fail_image("ghost:latest");
        let created = store
            .create(make_pod("web", "ghost:latest").into())
            .await
            .unwrap();

        manager.reconcile(&created.key()).await.unwrap();

        let pod = stored_pod(&store, "web").await;
        assert_eq!(pod.status.phase, PodPhase::Failed);
        assert!(
            pod.status
                .conditions
                .iter()
                .any(|c| c.reason == "ImagePullFailed")
        );

        // Terminal: another reconcile makes no further runtime calls.
        runtime.clear_calls();
        manager.reconcile(&created.key()).await.unwrap();
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_keeps_pod_pending() {
        let (store, runtime, manager) = setup().await;
        runtime.inject_transient_failures(1);
        let created = store
            .create(make_pod("web", "nginx:alpine").into())
            .await
            .unwrap();

        let err = manager.reconcile(&created.key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(stored_pod(&store, "web").await.status.phase, PodPhase::Pending);

        // The retry succeeds.
        manager.reconcile(&created.key()).await.unwrap();
        assert_eq!(stored_pod(&store, "web").await.status.phase, PodPhase::Running);
    }

    #[tokio::test]
    async fn exit_codes_map_to_phases() {
        let (store, runtime, manager) = setup().await;
        for (name, code, phase) in [
            ("done", 0, PodPhase::Succeeded),
            ("boom", 3, PodPhase::Failed),
        ] {
            let created = store
                .create(make_pod(name, "nginx:alpine").into())
                .await
                .unwrap();
            manager.reconcile(&created.key()).await.unwrap();
            let pod = stored_pod(&store, name).await;
            runtime.kill_container(&pod.status.container_id, code);

            manager.reconcile(&created.key()).await.unwrap();
            assert_eq!(stored_pod(&store, name).await.status.phase, phase);
        }
    }

    #[tokio::test]
    async fn vanished_container_fails_with_drift_reason() {
        let (store, runtime, manager) = setup().await;
        let created = store
            .create(make_pod("web", "nginx:alpine").into())
            .await
            .unwrap();
        manager.reconcile(&created.key()).await.unwrap();
        let pod = stored_pod(&store, "web").await;

        runtime.vanish_container(&pod.status.container_id);
        manager.reconcile(&created.key()).await.unwrap();

        let pod = stored_pod(&store, "web").await;
        assert_eq!(pod.status.phase, PodPhase::Failed);
        assert!(
            pod.status
                .conditions
                .iter()
                .any(|c| c.reason == "ContainerDisappeared")
        );
    }

    #[tokio::test]
    async fn deletion_removes_container_and_store_entry() {
        let (store, runtime, manager) = setup().await;
        let created = store
            .create(make_pod("web", "nginx:alpine").into())
            .await
            .unwrap();
        manager.reconcile(&created.key()).await.unwrap();
        let container_id = stored_pod(&store, "web").await.status.container_id;

        store.delete(&created.key()).await.unwrap();
        manager.reconcile(&created.key()).await.unwrap();

        assert!(runtime.container(&container_id).is_none());
        assert!(matches!(
            store.get(&created.key()).await,
            Err(Error::NotFound(_))
        ));

        // Idempotent against a concurrent sweep having won the race.
        manager.reconcile(&created.key()).await.unwrap();
    }

    #[tokio::test]
    async fn stale_name_conflict_is_cleared_then_retried() {
        let (store, runtime, manager) = setup().await;
        // A leftover container squats on the conventional name.
        runtime
            .run_container(RunSpec {
                name: "default-web".to_string(),
                image: "nginx:alpine".to_string(),
                env: HashMap::new(),
                labels: HashMap::new(),
                network: "orchestrator-net".to_string(),
            })
            .await
            .unwrap();

        let created = store
            .create(make_pod("web", "nginx:alpine").into())
            .await
            .unwrap();
        let err = manager.reconcile(&created.key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(runtime.container_named("default-web").is_none());

        manager.reconcile(&created.key()).await.unwrap();
        assert_eq!(stored_pod(&store, "web").await.status.phase, PodPhase::Running);
    }

    #[tokio::test]
    async fn quiescent_running_pod_only_inspects() {
        let (store, runtime, manager) = setup().await;
        let created = store
            .create(make_pod("web", "nginx:alpine").into())
            .await
            .unwrap();
        manager.reconcile(&created.key()).await.unwrap();

        runtime.clear_calls();
        manager.reconcile(&created.key()).await.unwrap();
        assert!(runtime.mutating_calls().is_empty());
    }
}
