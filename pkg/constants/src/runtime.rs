//! Container runtime constants: label keys, naming, call timeouts.

use std::time::Duration;

/// Label prefix identifying every container this orchestrator owns.
/// The startup sweep removes all containers carrying a label under it.
pub const LABEL_PREFIX: &str = "orchestrator/";

/// Runtime label carrying the pod name.
pub const LABEL_POD: &str = "orchestrator/pod";

/// Runtime label carrying the resource namespace.
pub const LABEL_NAMESPACE: &str = "orchestrator/namespace";

/// Runtime label carrying the service name (load-balancer containers).
pub const LABEL_SERVICE: &str = "orchestrator/service";

/// Timeout for starting a container.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for stopping/removing a container.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for inspecting a container.
pub const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Container name for a pod: `<namespace>-<podName>`.
pub fn pod_container_name(namespace: &str, pod: &str) -> String {
    format!("{}-{}", namespace, pod)
}

/// Container name for a service load balancer: `<namespace>-svc-<serviceName>`.
/// The runtime's network DNS makes the service reachable under this name.
pub fn lb_container_name(namespace: &str, service: &str) -> String {
    format!("{}-svc-{}", namespace, service)
}
