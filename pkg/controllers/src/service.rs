use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use pkg_constants::runtime::lb_container_name;
use pkg_runtime::RuntimeAdapter;
use pkg_state::{Event, Store};
use pkg_types::meta::{Kind, ResourceKey};
use pkg_types::object::Object;
use pkg_types::pod::PodPhase;
use pkg_types::selector;
use pkg_types::service::{Endpoint, Service};
use pkg_types::{Error, Result};

use crate::engine::Reconciler;

/// Maintains each Service's endpoint list by evaluating its selector
/// against live pods, and programs the L4 load balancer accordingly.
pub struct ServiceController {
    store: Store,
    runtime: Arc<dyn RuntimeAdapter>,
}

impl ServiceController {
    pub fn new(store: Store, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self { store, runtime }
    }

    /// Services a pod event may concern: those in the pod's namespace
    /// whose selector matches the pod's old or new labels. Selection never
    /// crosses namespaces.
    async fn services_for_pod(&self, event: &Event) -> Vec<ResourceKey> {
        let mut label_sets = vec![&event.object().meta().labels];
        if let Event::Updated { old, .. } = event {
            label_sets.push(&old.meta().labels);
        }
        let namespace = &event.object().meta().namespace;
        let mut keys = Vec::new();
        for svc in self.store.list(Kind::Service, namespace, None).await {
            if let Object::Service(svc) = svc {
                let matched = label_sets
                    .iter()
                    .any(|labels| selector::matches(&svc.spec.selector, labels));
                if matched && !keys.contains(&svc.key()) {
                    keys.push(svc.key());
                }
            }
        }
        keys
    }

    /// Endpoint set: Running pods with an address, matching the selector,
    /// in the Service's own namespace; one entry per pod and port. Sorted
    /// so comparisons against the recorded status are deterministic.
    async fn desired_endpoints(&self, svc: &Service) -> Vec<Endpoint> {
        let pods = self
            .store
            .list(Kind::Pod, &svc.metadata.namespace, Some(&svc.spec.selector))
            .await;
        let mut endpoints = Vec::new();
        for pod in pods.iter().filter_map(Object::as_pod) {
            if pod.status.phase != PodPhase::Running || pod.status.pod_ip.is_empty() {
                continue;
            }
            for port in &svc.spec.ports {
                endpoints.push(Endpoint {
                    ip: pod.status.pod_ip.clone(),
                    port: port.target_port,
                });
            }
        }
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }

    async fn sync(&self, svc: &Service) -> Result<()> {
        let endpoints = self.desired_endpoints(svc).await;
        let mut status = svc.status.clone();

        if status.load_balancer_id.is_empty() {
            let id = self
                .runtime
                .start_load_balancer(
                    &svc.metadata.namespace,
                    &svc.metadata.name,
                    &svc.spec.ports,
                    &endpoints,
                )
                .await?;
            info!(
                "service {}/{}: load balancer {} up with {} endpoints",
                svc.metadata.namespace,
                svc.metadata.name,
                id,
                endpoints.len()
            );
            status.load_balancer_id = id;
            status.forwarded_ports = svc.spec.ports.clone();
            status.endpoints = endpoints;
        } else if status.forwarded_ports != svc.spec.ports {
            // Host port bindings change with the port list: restart.
            self.runtime
                .stop_load_balancer(&status.load_balancer_id)
                .await?;
            let id = self
                .runtime
                .start_load_balancer(
                    &svc.metadata.namespace,
                    &svc.metadata.name,
                    &svc.spec.ports,
                    &endpoints,
                )
                .await?;
            info!(
                "service {}/{}: load balancer restarted for new port list",
                svc.metadata.namespace, svc.metadata.name
            );
            status.load_balancer_id = id;
            status.forwarded_ports = svc.spec.ports.clone();
            status.endpoints = endpoints;
        } else if status.endpoints != endpoints {
            self.runtime
                .update_load_balancer(&status.load_balancer_id, &endpoints)
                .await?;
            info!(
                "service {}/{}: endpoints → {}",
                svc.metadata.namespace,
                svc.metadata.name,
                endpoints.len()
            );
            status.endpoints = endpoints;
        } else {
            // Quiescent: no runtime call, no status write.
            return Ok(());
        }

        let mut updated = svc.clone();
        updated.status = status;
        match self.store.update_status(updated.into()).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Tear down the proxy, then drop the store entry. A Service owns no
    /// pods, so there is nothing further to cascade.
    async fn finish_deletion(&self, svc: &Service) -> Result<()> {
        let id = if svc.status.load_balancer_id.is_empty() {
            // The proxy may exist even though its id was never committed
            // (start racing a delete); remove by conventional name.
            lb_container_name(&svc.metadata.namespace, &svc.metadata.name)
        } else {
            svc.status.load_balancer_id.clone()
        };
        self.runtime.stop_load_balancer(&id).await?;
        info!(
            "service {}/{}: load balancer stopped",
            svc.metadata.namespace, svc.metadata.name
        );
        self.store.finalize(&svc.key()).await
    }
}

#[async_trait]
impl Reconciler for ServiceController {
    fn name(&self) -> &'static str {
        "service"
    }

    fn kind(&self) -> Kind {
        Kind::Service
    }

    fn watches(&self) -> Vec<Kind> {
        vec![Kind::Service, Kind::Pod]
    }

    async fn keys_for(&self, event: &Event) -> Vec<ResourceKey> {
        match event.object() {
            Object::Service(svc) => vec![svc.key()],
            Object::Pod(_) => self.services_for_pod(event).await,
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<()> {
        let svc = match self.store.get(key).await {
            Ok(obj) => match obj.into_service() {
                Some(svc) => svc,
                None => return Ok(()),
            },
            Err(Error::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if svc.metadata.is_deleting() {
            self.finish_deletion(&svc).await
        } else {
            self.sync(&svc).await
        }
    }
}
