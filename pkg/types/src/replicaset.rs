use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::meta::{Condition, Kind, ObjectMeta, ResourceKey};
use crate::pod::PodSpec;

// --- Pod template ---

/// Labels stamped onto pods created from the template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateMeta {
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: PodSpec,
}

// --- ReplicaSet spec ---

/// `replicas` is signed so that a negative count from a client surfaces
/// as a validation error rather than a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: HashMap<String, String>,
    pub template: PodTemplateSpec,
}

// --- ReplicaSet status ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetStatus {
    /// Non-terminal owned pods known to exist.
    #[serde(default)]
    pub replicas: i32,
    /// Owned pods currently in Running phase.
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// --- ReplicaSet ---

fn api_version() -> String {
    "apps/v1".to_string()
}

fn kind() -> String {
    "ReplicaSet".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSet {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
}

impl ReplicaSet {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            Kind::ReplicaSet,
            &self.metadata.namespace,
            &self.metadata.name,
        )
    }
}
