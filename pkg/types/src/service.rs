use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::meta::{Condition, Kind, ObjectMeta, ResourceKey};

// --- Ports ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Protocol {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub protocol: Protocol,
    /// Port the load balancer listens on (and publishes on the host).
    pub port: u16,
    /// Port the backend pods listen on.
    pub target_port: u16,
}

// --- Service spec ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceType {
    #[default]
    ClusterIP,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: HashMap<String, String>,
    pub ports: Vec<ServicePort>,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
}

// --- Endpoints & status ---

/// A `(podIP, targetPort)` pair reachable inside the pod network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Running pods matching the selector, one entry per pod × port.
    /// Kept sorted for deterministic comparison.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Runtime id of the L4 proxy container serving this Service.
    #[serde(default, rename = "loadBalancerID")]
    pub load_balancer_id: String,
    /// Port list the running load balancer was programmed with; a
    /// difference against `spec.ports` forces a proxy restart because the
    /// published host ports change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwarded_ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// --- Service ---

fn api_version() -> String {
    "v1".to_string()
}

fn kind() -> String {
    "Service".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

impl Service {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(Kind::Service, &self.metadata.namespace, &self.metadata.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_tcp() {
        let port: ServicePort =
            serde_json::from_str(r#"{"port": 2000, "targetPort": 5000}"#).unwrap();
        assert_eq!(port.protocol, Protocol::Tcp);
        assert_eq!(port.target_port, 5000);
    }

    #[test]
    fn status_load_balancer_field_name() {
        let status = ServiceStatus {
            endpoints: vec![Endpoint {
                ip: "10.89.0.4".to_string(),
                port: 5000,
            }],
            load_balancer_id: "lb-1".to_string(),
            forwarded_ports: vec![],
            conditions: vec![],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["loadBalancerID"], "lb-1");
        assert_eq!(json["endpoints"][0]["ip"], "10.89.0.4");
    }

    #[test]
    fn endpoints_sort_deterministically() {
        let mut endpoints = vec![
            Endpoint {
                ip: "10.89.0.5".to_string(),
                port: 5000,
            },
            Endpoint {
                ip: "10.89.0.4".to_string(),
                port: 5000,
            },
            Endpoint {
                ip: "10.89.0.4".to_string(),
                port: 4000,
            },
        ];
        endpoints.sort();
        assert_eq!(endpoints[0].ip, "10.89.0.4");
        assert_eq!(endpoints[0].port, 4000);
        assert_eq!(endpoints[2].ip, "10.89.0.5");
    }
}
