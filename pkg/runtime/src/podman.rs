use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use pkg_constants::network::{LB_BIND_ADDR, POD_NETWORK};
use pkg_constants::runtime::{
    INSPECT_TIMEOUT, LABEL_NAMESPACE, LABEL_SERVICE, START_TIMEOUT, STOP_TIMEOUT,
    lb_container_name,
};
use pkg_types::service::{Endpoint, ServicePort};

use crate::adapter::{
    ContainerState, RunSpec, RunningContainer, RuntimeAdapter, RuntimeError, RuntimeResult,
};

/// Bookkeeping for a running load-balancer container, kept so an endpoint
/// push can regenerate the proxy config without restarting it.
struct LbEntry {
    name: String,
    config_path: PathBuf,
    ports: Vec<ServicePort>,
}

/// Runtime adapter backed by the Podman CLI.
///
/// Pods run as detached containers on the shared bridge network; each
/// Service gets an `nginx:alpine` container running a generated TCP
/// `stream` proxy config, bind-mounted from a scratch directory.
pub struct PodmanRuntime {
    config_dir: PathBuf,
    load_balancers: DashMap<String, LbEntry>,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self {
            config_dir: std::env::temp_dir().join("rudder-lb"),
            load_balancers: DashMap::new(),
        }
    }

    /// Run `podman <args>` under a deadline. Spawn failures and deadline
    /// overruns are errors; a non-zero exit is returned as-is for the
    /// caller to classify against stderr.
    async fn podman_raw(&self, args: &[&str], limit: Duration) -> RuntimeResult<Output> {
        let mut cmd = Command::new("podman");
        cmd.args(args);
        match tokio::time::timeout(limit, cmd.output()).await {
            Err(_) => Err(RuntimeError::Timeout(format!("podman {}", args.join(" ")))),
            Ok(Err(e)) => Err(RuntimeError::Other(format!("spawn podman: {}", e))),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Like `podman_raw`, but a non-zero exit is classified into a
    /// `RuntimeError`. Returns trimmed stdout on success.
    async fn podman(&self, args: &[&str], limit: Duration) -> RuntimeResult<String> {
        let output = self.podman_raw(args, limit).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify(&stderr))
        }
    }

    async fn container_ip(&self, id: &str) -> RuntimeResult<String> {
        let raw = self.podman(&["inspect", id], INSPECT_TIMEOUT).await?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Other(format!("parse inspect output: {}", e)))?;
        let ip = parsed[0]["NetworkSettings"]["Networks"][POD_NETWORK]["IPAddress"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if ip.is_empty() {
            return Err(RuntimeError::Other(format!(
                "container {} has no address on {}",
                id, POD_NETWORK
            )));
        }
        Ok(ip)
    }

    async fn write_lb_config(
        &self,
        path: &Path,
        ports: &[ServicePort],
        endpoints: &[Endpoint],
    ) -> RuntimeResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RuntimeError::Other(format!("create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(path, render_lb_config(ports, endpoints))
            .await
            .map_err(|e| RuntimeError::Other(format!("write {}: {}", path.display(), e)))
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Map podman stderr onto an error kind.
fn classify(stderr: &str) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("already in use") {
        RuntimeError::NameConflict(stderr.to_string())
    } else if lower.contains("manifest unknown")
        || lower.contains("unable to pull")
        || lower.contains("pull access denied")
        || lower.contains("name unknown")
    {
        RuntimeError::ImagePullFailed(stderr.to_string())
    } else {
        RuntimeError::Other(stderr.to_string())
    }
}

/// nginx config with one TCP listener per service port. An upstream with
/// no live backends keeps a single `down` server so the config stays
/// loadable while no pod matches.
fn render_lb_config(ports: &[ServicePort], endpoints: &[Endpoint]) -> String {
    let mut out = String::from("events {}\nstream {\n");
    for port in ports {
        out.push_str(&format!("    upstream be_{} {{\n", port.port));
        let mut wrote = false;
        for ep in endpoints.iter().filter(|e| e.port == port.target_port) {
            out.push_str(&format!("        server {}:{};\n", ep.ip, ep.port));
            wrote = true;
        }
        if !wrote {
            out.push_str("        server 127.0.0.1:1 down;\n");
        }
        out.push_str("    }\n");
        out.push_str(&format!(
            "    server {{\n        listen {};\n        proxy_pass be_{};\n    }}\n",
            port.port, port.port
        ));
    }
    out.push_str("}\n");
    out
}

#[async_trait]
impl RuntimeAdapter for PodmanRuntime {
    async fn ensure_network(&self) -> RuntimeResult<String> {
        let exists = self
            .podman(&["network", "exists", POD_NETWORK], INSPECT_TIMEOUT)
            .await;
        if exists.is_err() {
            match self
                .podman(&["network", "create", POD_NETWORK], START_TIMEOUT)
                .await
            {
                Ok(_) => info!("created pod network {}", POD_NETWORK),
                // Racing creators are fine.
                Err(RuntimeError::Other(msg)) if msg.contains("already exists") => {}
                Err(e) => return Err(e),
            }
        }
        Ok(POD_NETWORK.to_string())
    }

    async fn run_container(&self, spec: RunSpec) -> RuntimeResult<RunningContainer> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--network".into(),
            spec.network.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.podman(&arg_refs, START_TIMEOUT).await?;
        let ip = self.container_ip(&id).await?;
        info!("started container {} ({}) at {}", spec.name, id, ip);
        Ok(RunningContainer { id, ip })
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState> {
        let output = self.podman_raw(&["inspect", id], INSPECT_TIMEOUT).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("no such container") || stderr.contains("no such object") {
                return Ok(ContainerState::Missing);
            }
            return Err(classify(&stderr));
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        let parsed: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Other(format!("parse inspect output: {}", e)))?;
        let state = parsed[0]["State"]["Status"].as_str().unwrap_or_default();
        if state == "running" {
            Ok(ContainerState::Running)
        } else {
            let code = parsed[0]["State"]["ExitCode"].as_i64().unwrap_or(-1) as i32;
            Ok(ContainerState::Exited(code))
        }
    }

    async fn stop_and_remove(&self, id: &str) -> RuntimeResult<()> {
        if let Err(e) = self.podman(&["rm", "-f", "-t", "5", id], STOP_TIMEOUT).await {
            warn!("stop_and_remove {}: {}", id, e);
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
        let network = self.ensure_network().await?;
        let name = lb_container_name(namespace, service);
        // Clear any stale proxy left from a previous incarnation.
        self.stop_and_remove(&name).await?;

        let config_path = self.config_dir.join(format!("{}.conf", name));
        self.write_lb_config(&config_path, ports, endpoints).await?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--network".into(),
            network,
            "--label".into(),
            format!("{}={}", LABEL_SERVICE, service),
            "--label".into(),
            format!("{}={}", LABEL_NAMESPACE, namespace),
            "-v".into(),
            format!("{}:/etc/nginx/nginx.conf:ro", config_path.display()),
        ];
        for port in ports {
            args.push("-p".into());
            args.push(format!("{}:{}:{}", LB_BIND_ADDR, port.port, port.port));
        }
        args.push("nginx:alpine".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.podman(&arg_refs, START_TIMEOUT).await?;
        info!(
            "started load balancer {} ({}) with {} endpoints",
            name,
            id,
            endpoints.len()
        );
        self.load_balancers.insert(
            id.clone(),
            LbEntry {
                name,
                config_path,
                ports: ports.to_vec(),
            },
        );
        Ok(id)
    }

    async fn update_load_balancer(&self, id: &str, endpoints: &[Endpoint]) -> RuntimeResult<()> {
        let (config_path, ports, name) = match self.load_balancers.get(id) {
            Some(entry) => (
                entry.config_path.clone(),
                entry.ports.clone(),
                entry.name.clone(),
            ),
            None => {
                return Err(RuntimeError::Other(format!(
                    "unknown load balancer {}",
                    id
                )));
            }
        };
        self.write_lb_config(&config_path, &ports, endpoints).await?;
        // Reload in place; fall back to a container restart, which rereads
        // the bind-mounted config.
        if self
            .podman(&["exec", id, "nginx", "-s", "reload"], STOP_TIMEOUT)
            .await
            .is_err()
        {
            warn!("reload of {} failed; restarting", name);
            self.podman(&["restart", "-t", "5", id], START_TIMEOUT).await?;
        }
        info!("load balancer {} now has {} endpoints", name, endpoints.len());
        Ok(())
    }

    async fn stop_load_balancer(&self, id: &str) -> RuntimeResult<()> {
        if let Some((_, entry)) = self.load_balancers.remove(id) {
            let _ = tokio::fs::remove_file(&entry.config_path).await;
        }
        self.stop_and_remove(id).await
    }

    async fn sweep_orphans(&self) -> RuntimeResult<usize> {
        // Both pod and LB containers carry the namespace label.
        let filter = format!("label={}", LABEL_NAMESPACE);
        let out = self
            .podman(
                &["ps", "-a", "--filter", &filter, "--format", "{{.ID}}"],
                STOP_TIMEOUT,
            )
            .await?;
        let ids: Vec<&str> = out.lines().filter(|l| !l.trim().is_empty()).collect();
        for id in &ids {
            self.stop_and_remove(id).await?;
        }
        if !ids.is_empty() {
            info!("swept {} orphaned containers", ids.len());
        }
        Ok(ids.len())
    }
}
