//! End-to-end convergence scenarios: real store + engine, fake runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pkg_controllers::{
    Engine, EngineHandle, PodLifecycleManager, ReplicaSetController, ServiceController,
};
use pkg_runtime::FakeRuntime;
use pkg_state::Store;
use pkg_types::meta::{Kind, ObjectMeta, ResourceKey};
use pkg_types::object::Object;
use pkg_types::pod::{ContainerSpec, Pod, PodPhase, PodSpec};
use pkg_types::replicaset::{PodTemplateSpec, ReplicaSet, ReplicaSetSpec, TemplateMeta};
use pkg_types::service::{Protocol, Service, ServicePort, ServiceSpec, ServiceType};

const TICK: Duration = Duration::from_millis(100);
const DEADLINE: Duration = Duration::from_secs(5);

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn make_replicaset(name: &str, app: &str, replicas: i32) -> ReplicaSet {
    ReplicaSet {
        api_version: "apps/v1".to_string(),
        kind: "ReplicaSet".to_string(),
        metadata: ObjectMeta::named("default", name),
        spec: ReplicaSetSpec {
            replicas,
            selector: labels(&[("app", app)]),
            template: PodTemplateSpec {
                metadata: TemplateMeta {
                    labels: labels(&[("app", app)]),
                },
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: "app".to_string(),
                        image: "nginx:alpine".to_string(),
                        env: HashMap::new(),
                    }],
                },
            },
        },
        status: Default::default(),
    }
}

fn make_pod(name: &str, app: &str, image: &str) -> Pod {
    let mut pod = Pod {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: ObjectMeta::named("default", name),
        spec: PodSpec {
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                image: image.to_string(),
                env: HashMap::new(),
            }],
        },
        status: Default::default(),
    };
    pod.metadata.labels = labels(&[("app", app)]);
    pod
}

fn make_service(name: &str, app: &str, port: u16, target: u16) -> Service {
    Service {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        metadata: ObjectMeta::named("default", name),
        spec: ServiceSpec {
            selector: labels(&[("app", app)]),
            ports: vec![ServicePort {
                protocol: Protocol::Tcp,
                port,
                target_port: target,
            }],
            service_type: ServiceType::ClusterIP,
        },
        status: Default::default(),
    }
}

fn start_engine(store: &Store, runtime: &Arc<FakeRuntime>) -> EngineHandle {
    Engine::new(store.clone())
        .with_tick(TICK)
        .register(Arc::new(PodLifecycleManager::new(
            store.clone(),
            runtime.clone(),
        )))
        .register(Arc::new(ReplicaSetController::new(store.clone())))
        .register(Arc::new(ServiceController::new(
            store.clone(),
            runtime.clone(),
        )))
        .start()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + DEADLINE;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn live_pods(store: &Store) -> Vec<Pod> {
    store
        .list(Kind::Pod, "default", None)
        .await
        .into_iter()
        .filter_map(Object::into_pod)
        .collect()
}

async fn running_pods(store: &Store) -> Vec<Pod> {
    live_pods(store)
        .await
        .into_iter()
        .filter(|p| p.status.phase == PodPhase::Running)
        .collect()
}

async fn stored_rs(store: &Store, name: &str) -> ReplicaSet {
    store
        .get(&ResourceKey::new(Kind::ReplicaSet, "default", name))
        .await
        .unwrap()
        .into_replicaset()
        .unwrap()
}

async fn stored_service(store: &Store, name: &str) -> Service {
    store
        .get(&ResourceKey::new(Kind::Service, "default", name))
        .await
        .unwrap()
        .into_service()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicaset_scales_up_then_down_then_recovers_drift() {
    let store = Store::new();
    let runtime = Arc::new(FakeRuntime::new());
    let handle = start_engine(&store, &runtime);

    // Scale up: 3 replicas all Running, owned, counted.
    let rs = store
        .create(make_replicaset("web", "test", 3).into())
        .await
        .unwrap();
    let rs_uid = rs.meta().uid.clone();
    eventually("3 running pods", || {
        let store = store.clone();
        async move { running_pods(&store).await.len() == 3 }
    })
    .await;
    for pod in running_pods(&store).await {
        assert_eq!(
            pod.metadata.controller_owner().map(|o| o.uid.clone()),
            Some(rs_uid.clone())
        );
        assert!(!pod.status.container_id.is_empty());
        assert!(!pod.status.pod_ip.is_empty());
    }
    eventually("status.replicas == 3", || {
        let store = store.clone();
        async move { stored_rs(&store, "web").await.status.replicas == 3 }
    })
    .await;

    // Scale to 5, then down to 2.
    let mut scaled = stored_rs(&store, "web").await;
    scaled.spec.replicas = 5;
    store.update(scaled.into()).await.unwrap();
    eventually("5 running pods", || {
        let store = store.clone();
        async move { running_pods(&store).await.len() == 5 }
    })
    .await;

    let mut scaled = stored_rs(&store, "web").await;
    scaled.spec.replicas = 2;
    store.update(scaled.into()).await.unwrap();
    eventually("exactly 2 pods remain", || {
        let store = store.clone();
        async move {
            let pods = live_pods(&store).await;
            pods.len() == 2 && pods.iter().all(|p| p.status.phase == PodPhase::Running)
        }
    })
    .await;

    // Drift: one container vanishes out of band; a replacement appears
    // with a fresh name and uid.
    let before = running_pods(&store).await;
    let victim = before[0].clone();
    runtime.vanish_container(&victim.status.container_id);
    eventually("drift recovered to 2 running pods", || {
        let store = store.clone();
        let victim_name = victim.metadata.name.clone();
        async move {
            let pods = running_pods(&store).await;
            pods.len() == 2 && pods.iter().any(|p| p.metadata.name != victim_name)
        }
    })
    .await;
    let after = running_pods(&store).await;
    let fresh: Vec<&Pod> = after
        .iter()
        .filter(|p| p.metadata.name != victim.metadata.name)
        .collect();
    assert!(fresh.iter().all(|p| p.metadata.uid != victim.metadata.uid));

    // Cascade delete: no pods, no set, no containers.
    store
        .delete(&ResourceKey::new(Kind::ReplicaSet, "default", "web"))
        .await
        .unwrap();
    eventually("cascade removed everything", || {
        let store = store.clone();
        let runtime = runtime.clone();
        async move {
            live_pods(&store).await.is_empty()
                && store.keys(Kind::Pod).await.is_empty()
                && store.keys(Kind::ReplicaSet).await.is_empty()
                && runtime.running_count() == 0
        }
    })
    .await;

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_endpoints_track_matching_running_pods() {
    let store = Store::new();
    let runtime = Arc::new(FakeRuntime::new());
    let handle = start_engine(&store, &runtime);

    store
        .create(make_service("health-service", "health", 2000, 5000).into())
        .await
        .unwrap();
    store
        .create(make_pod("health-1", "health", "health:latest").into())
        .await
        .unwrap();

    eventually("one endpoint", || {
        let store = store.clone();
        async move {
            stored_service(&store, "health-service")
                .await
                .status
                .endpoints
                .len()
                == 1
        }
    })
    .await;
    let svc = stored_service(&store, "health-service").await;
    let lb = runtime.load_balancer(&svc.status.load_balancer_id).unwrap();
    assert_eq!(lb.name, "default-svc-health-service");
    assert_eq!(lb.endpoints, svc.status.endpoints);
    assert_eq!(lb.endpoints[0].port, 5000);

    // Second matching pod → two endpoints.
    store
        .create(make_pod("health-2", "health", "health:latest").into())
        .await
        .unwrap();
    eventually("two endpoints", || {
        let store = store.clone();
        async move {
            stored_service(&store, "health-service")
                .await
                .status
                .endpoints
                .len()
                == 2
        }
    })
    .await;

    // Delete one → back to one endpoint.
    store
        .delete(&ResourceKey::new(Kind::Pod, "default", "health-1"))
        .await
        .unwrap();
    eventually("one endpoint again", || {
        let store = store.clone();
        async move {
            stored_service(&store, "health-service")
                .await
                .status
                .endpoints
                .len()
                == 1
        }
    })
    .await;

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quiescent_ticks_make_no_mutating_runtime_calls() {
    let store = Store::new();
    let runtime = Arc::new(FakeRuntime::new());
    let handle = start_engine(&store, &runtime);

    store
        .create(make_replicaset("web", "web", 2).into())
        .await
        .unwrap();
    store
        .create(make_service("web", "web", 8080, 80).into())
        .await
        .unwrap();
    eventually("steady state", || {
        let store = store.clone();
        async move {
            running_pods(&store).await.len() == 2
                && stored_service(&store, "web").await.status.endpoints.len() == 2
        }
    })
    .await;

    // Several ticks over an unchanged world: observation only.
    runtime.clear_calls();
    tokio::time::sleep(TICK * 5).await;
    assert!(
        runtime.mutating_calls().is_empty(),
        "quiescent ticks must not mutate the runtime: {:?}",
        runtime.mutating_calls()
    );

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_image_surfaces_condition_and_replicaset_keeps_retrying_with_new_pods() {
    let store = Store::new();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.fail_image("ghost:latest");
    let handle = start_engine(&store, &runtime);

    // An unowned pod with the bad image fails terminally and stays put:
    // the condition is observable at rest.
    store
        .create(make_pod("lone-ghost", "lone", "ghost:latest").into())
        .await
        .unwrap();
    eventually("lone pod failed with ImagePullFailed", || {
        let store = store.clone();
        async move {
            live_pods(&store).await.iter().any(|p| {
                p.metadata.name == "lone-ghost"
                    && p.status.phase == PodPhase::Failed
                    && p.status
                        .conditions
                        .iter()
                        .any(|c| c.reason == "ImagePullFailed")
            })
        }
    })
    .await;

    // An owned pod is reaped and replaced: the set keeps trying with
    // fresh pods rather than wedging on the failed one.
    let mut rs = make_replicaset("ghost", "ghost", 1);
    rs.spec.template.spec.containers[0].image = "ghost:latest".to_string();
    store.create(rs.into()).await.unwrap();
    eventually("replicaset tried more than one pod", || {
        let runtime = runtime.clone();
        async move {
            let attempts = runtime
                .calls()
                .iter()
                .filter(|c| c.starts_with("run_container default-ghost-"))
                .count();
            attempts >= 2
        }
    })
    .await;

    // Other objects keep reconciling meanwhile.
    store
        .create(make_pod("healthy", "ok", "nginx:alpine").into())
        .await
        .unwrap();
    eventually("healthy pod runs despite failing set", || {
        let store = store.clone();
        async move {
            live_pods(&store)
                .await
                .iter()
                .any(|p| p.metadata.name == "healthy" && p.status.phase == PodPhase::Running)
        }
    })
    .await;

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_api_writes_settle_into_a_serializable_state() {
    let store = Store::new();
    let runtime = Arc::new(FakeRuntime::new());
    let handle = start_engine(&store, &runtime);

    // A burst of concurrent creates across kinds.
    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .create(make_pod(&format!("burst-{}", i), "burst", "nginx:alpine").into())
                .await
        }));
    }
    {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .create(make_service("burst", "burst", 9000, 80).into())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    eventually("all pods running and service fully endpointed", || {
        let store = store.clone();
        async move {
            running_pods(&store).await.len() == 8
                && stored_service(&store, "burst").await.status.endpoints.len() == 8
        }
    })
    .await;

    handle.shutdown(Duration::from_secs(1)).await;
}
