use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use pkg_constants::network::POD_NETWORK;
use pkg_types::service::{Endpoint, ServicePort};

use crate::adapter::{
    ContainerState, RunSpec, RunningContainer, RuntimeAdapter, RuntimeError, RuntimeResult,
};

/// A simulated container tracked by the fake runtime.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub ip: String,
    pub state: ContainerState,
}

/// A simulated L4 proxy instance.
#[derive(Debug, Clone)]
pub struct FakeLoadBalancer {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub ports: Vec<ServicePort>,
    pub endpoints: Vec<Endpoint>,
}

/// In-memory runtime simulating container states, failures, and timing.
/// Every §-level testable property of the control plane runs against this
/// instead of Podman.
///
/// Failure injection: `fail_image` makes runs of that image report an
/// image-pull failure; `inject_transient_failures` makes the next N run
/// calls fail transiently. Out-of-band drift: `kill_container` (exited)
/// and `vanish_container` (missing).
pub struct FakeRuntime {
    containers: DashMap<String, FakeContainer>,
    load_balancers: DashMap<String, FakeLoadBalancer>,
    next_ip: AtomicU32,
    next_id: AtomicU64,
    calls: Mutex<Vec<String>>,
    failing_images: Mutex<HashSet<String>>,
    transient_failures: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            load_balancers: DashMap::new(),
            next_ip: AtomicU32::new(2),
            next_id: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
            failing_images: Mutex::new(HashSet::new()),
            transient_failures: AtomicU32::new(0),
        }
    }

    // --- Failure & drift injection ---

    /// Every future `run_container` of this image fails with
    /// `ImagePullFailed`.
    pub fn fail_image(&self, image: &str) {
        if let Ok(mut failing) = self.failing_images.lock() {
            failing.insert(image.to_string());
        }
    }

    /// The next `count` `run_container` calls fail transiently.
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Out-of-band stop: the container reports Exited with `code`.
    pub fn kill_container(&self, id: &str, code: i32) {
        if let Some(mut container) = self.containers.get_mut(id) {
            container.state = ContainerState::Exited(code);
        }
    }

    /// Out-of-band removal: the container vanishes entirely.
    pub fn vanish_container(&self, id: &str) {
        self.containers.remove(id);
    }

    // --- Test observation ---

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.containers.get(id).map(|c| c.clone())
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.clone())
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .iter()
            .filter(|c| c.state == ContainerState::Running)
            .count()
    }

    pub fn load_balancer(&self, id: &str) -> Option<FakeLoadBalancer> {
        self.load_balancers.get(id).map(|lb| lb.clone())
    }

    pub fn load_balancer_count(&self) -> usize {
        self.load_balancers.len()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Recorded calls that mutate runtime state (everything except
    /// `ensure_network` and `inspect`).
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("ensure_network") && !c.starts_with("inspect"))
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn allocate_ip(&self) -> String {
        format!("10.89.0.{}", self.next_ip.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn ensure_network(&self) -> RuntimeResult<String> {
        self.record("ensure_network".to_string());
        Ok(POD_NETWORK.to_string())
    }

    async fn run_container(&self, spec: RunSpec) -> RuntimeResult<RunningContainer> {
        self.record(format!("run_container {}", spec.name));

        let failing = self
            .failing_images
            .lock()
            .map(|f| f.contains(&spec.image))
            .unwrap_or(false);
        if failing {
            return Err(RuntimeError::ImagePullFailed(format!(
                "manifest unknown: {}",
                spec.image
            )));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RuntimeError::Other("injected transient failure".to_string()));
        }
        if self.containers.iter().any(|c| c.name == spec.name) {
            return Err(RuntimeError::NameConflict(spec.name));
        }

        let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let container = FakeContainer {
            id: id.clone(),
            name: spec.name,
            image: spec.image,
            env: spec.env,
            labels: spec.labels,
            ip: self.allocate_ip(),
            state: ContainerState::Running,
        };
        let ip = container.ip.clone();
        self.containers.insert(id.clone(), container);
        Ok(RunningContainer { id, ip })
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState> {
        self.record(format!("inspect {}", id));
        Ok(self
            .containers
            .get(id)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Missing))
    }

    async fn stop_and_remove(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("stop_and_remove {}", id));
        if self.containers.remove(id).is_none() {
            // Callers may pass the conventional name instead of an id.
            let by_name: Option<String> = self
                .containers
                .iter()
                .find(|c| c.name == id)
                .map(|c| c.id.clone());
            if let Some(found) = by_name {
                self.containers.remove(&found);
            }
        }
        Ok(())
    }

    async fn start_load_balancer(
        &self,
        namespace: &str,
        service: &str,
        ports: &[ServicePort],
        endpoints: &[Endpoint],
    ) -> RuntimeResult<String> {
        self.record(format!("start_load_balancer {}/{}", namespace, service));
        let name = pkg_constants::runtime::lb_container_name(namespace, service);
        // Replace any stale proxy with the same name.
        let stale: Vec<String> = self
            .load_balancers
            .iter()
            .filter(|lb| lb.name == name)
            .map(|lb| lb.id.clone())
            .collect();
        for id in stale {
            self.load_balancers.remove(&id);
        }

        let id = format!("lb-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.load_balancers.insert(
            id.clone(),
            FakeLoadBalancer {
                id: id.clone(),
                name,
                namespace: namespace.to_string(),
                ports: ports.to_vec(),
                endpoints: endpoints.to_vec(),
            },
        );
        Ok(id)
    }

    async fn update_load_balancer(&self, id: &str, endpoints: &[Endpoint]) -> RuntimeResult<()> {
        self.record(format!("update_load_balancer {}", id));
        match self.load_balancers.get_mut(id) {
            Some(mut lb) => {
                lb.endpoints = endpoints.to_vec();
                Ok(())
            }
            None => Err(RuntimeError::Other(format!("unknown load balancer {}", id))),
        }
    }

    async fn stop_load_balancer(&self, id: &str) -> RuntimeResult<()> {
        self.record(format!("stop_load_balancer {}", id));
        self.load_balancers.remove(id);
        Ok(())
    }

    async fn sweep_orphans(&self) -> RuntimeResult<usize> {
        self.record("sweep_orphans".to_string());
        let count = self.containers.len() + self.load_balancers.len();
        self.containers.clear();
        self.load_balancers.clear();
        Ok(count)
    }
}
