use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use pkg_types::service::{Endpoint, ServicePort};

/// Failures surfaced by runtime operations, classified so controllers can
/// decide between a backoff retry and a terminal condition.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The image cannot be pulled; will not self-heal.
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),
    /// A container with the requested name already exists.
    #[error("container name already in use: {0}")]
    NameConflict(String),
    /// The call exceeded its deadline; treated as transient.
    #[error("runtime call timed out: {0}")]
    Timeout(String),
    #[error("runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Fatal errors are recorded in status conditions and never retried on
    /// the same object.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::ImagePullFailed(_))
    }
}

impl From<RuntimeError> for pkg_types::Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ImagePullFailed(message) => pkg_types::Error::RuntimeFatal {
                reason: "ImagePullFailed".to_string(),
                message,
            },
            other => pkg_types::Error::RuntimeTransient(other.to_string()),
        }
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to start one pod container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// Runtime labels: the pod's own labels plus the orchestrator tags.
    pub labels: HashMap<String, String>,
    pub network: String,
}

#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    pub ip: String,
}

/// Observed container state, as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i32),
    Missing,
}

/// Boundary to the external container engine. The pod lifecycle manager
/// and the Service controller are written against this trait; production
/// backs it with Podman, tests with [`crate::FakeRuntime`].
///
/// Every call may block on process spawns or network I/O and therefore
/// carries its own deadline; none of them may be made while holding the
/// store's write guard.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    /// Idempotent; returns the name of the shared user-defined bridge
    /// network all pods live in.
    async fn ensure_network(&self) -> RuntimeResult<String>;

    /// Start a detached container attached to `spec.network`.
    async fn run_container(&self, spec: RunSpec) -> RuntimeResult<RunningContainer>;

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState>;

    /// Best-effort and idempotent; accepts a container id or name and
    /// never fails fatally.
    async fn stop_and_remove(&self, id: &str) -> RuntimeResult<()>;

    /// Start (or replace) the L4 proxy container for a Service. Each
    /// `port` is published on the host; traffic forwards to the current
    /// endpoint set. Returns the proxy's container id.
    async fn start_load_balancer(
        &self,
        namespace: &str,
        service: &str,
        ports: &[ServicePort],
        endpoints: &[Endpoint],
    ) -> RuntimeResult<String>;

    /// Push a new endpoint set into a running proxy without changing its
    /// published ports.
    async fn update_load_balancer(&self, id: &str, endpoints: &[Endpoint]) -> RuntimeResult<()>;

    /// Idempotent.
    async fn stop_load_balancer(&self, id: &str) -> RuntimeResult<()>;

    /// Startup recovery: remove every container carrying the orchestrator
    /// label prefix. Control-plane state is rebuilt empty; leftover
    /// containers from a previous process are discarded, not adopted.
    async fn sweep_orphans(&self) -> RuntimeResult<usize>;
}
