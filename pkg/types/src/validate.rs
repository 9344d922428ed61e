use crate::error::{Error, Result};
use crate::pod::{Pod, PodSpec};
use crate::replicaset::ReplicaSet;
use crate::selector;
use crate::service::Service;

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("name must not be empty".to_string()));
    }
    if name.len() > 63 {
        return Err(Error::Validation(format!(
            "name '{}' exceeds 63 characters (got {})",
            name,
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(format!(
            "name '{}' must not start or end with a hyphen",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::Validation(format!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        )));
    }
    Ok(())
}

fn validate_pod_spec(spec: &PodSpec) -> Result<()> {
    if spec.containers.len() != 1 {
        return Err(Error::Validation(format!(
            "pod spec must have exactly 1 container (got {})",
            spec.containers.len()
        )));
    }
    let container = &spec.containers[0];
    validate_name(&container.name)?;
    if container.image.is_empty() {
        return Err(Error::Validation(format!(
            "container '{}' has no image",
            container.name
        )));
    }
    Ok(())
}

pub fn validate_pod(pod: &Pod) -> Result<()> {
    validate_name(&pod.metadata.name)?;
    validate_name(&pod.metadata.namespace)?;
    validate_pod_spec(&pod.spec)
}

pub fn validate_replicaset(rs: &ReplicaSet) -> Result<()> {
    validate_name(&rs.metadata.name)?;
    validate_name(&rs.metadata.namespace)?;
    if rs.spec.replicas < 0 {
        return Err(Error::Validation(format!(
            "spec.replicas must be non-negative (got {})",
            rs.spec.replicas
        )));
    }
    if rs.spec.selector.is_empty() {
        return Err(Error::Validation(
            "spec.selector must have at least one key".to_string(),
        ));
    }
    if !selector::matches(&rs.spec.selector, &rs.spec.template.metadata.labels) {
        return Err(Error::Validation(
            "spec.template labels must satisfy spec.selector".to_string(),
        ));
    }
    validate_pod_spec(&rs.spec.template.spec)
}

pub fn validate_service(svc: &Service) -> Result<()> {
    validate_name(&svc.metadata.name)?;
    validate_name(&svc.metadata.namespace)?;
    if svc.spec.ports.is_empty() {
        return Err(Error::Validation(
            "spec.ports must have at least one entry".to_string(),
        ));
    }
    for port in &svc.spec.ports {
        if port.port == 0 || port.target_port == 0 {
            return Err(Error::Validation(
                "service ports must be non-zero".to_string(),
            ));
        }
    }
    Ok(())
}
