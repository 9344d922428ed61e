use serde::{Deserialize, Serialize};

use crate::meta::{Kind, ObjectMeta, ResourceKey};
use crate::pod::Pod;
use crate::replicaset::ReplicaSet;
use crate::service::Service;

/// Sum of every resource the store holds. Gives the store and engine one
/// uniform handle over metadata without erasing the concrete types the
/// controllers work with.
#[derive(Debug, Clone)]
pub enum Object {
    Pod(Pod),
    ReplicaSet(ReplicaSet),
    Service(Service),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Pod(_) => Kind::Pod,
            Object::ReplicaSet(_) => Kind::ReplicaSet,
            Object::Service(_) => Kind::Service,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::Pod(p) => &p.metadata,
            Object::ReplicaSet(rs) => &rs.metadata,
            Object::Service(s) => &s.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::Pod(p) => &mut p.metadata,
            Object::ReplicaSet(rs) => &mut rs.metadata,
            Object::Service(s) => &mut s.metadata,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), &self.meta().namespace, &self.meta().name)
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Object::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_replicaset(&self) -> Option<&ReplicaSet> {
        match self {
            Object::ReplicaSet(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            Object::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_pod(self) -> Option<Pod> {
        match self {
            Object::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_replicaset(self) -> Option<ReplicaSet> {
        match self {
            Object::ReplicaSet(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn into_service(self) -> Option<Service> {
        match self {
            Object::Service(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Pod> for Object {
    fn from(pod: Pod) -> Self {
        Object::Pod(pod)
    }
}

impl From<ReplicaSet> for Object {
    fn from(rs: ReplicaSet) -> Self {
        Object::ReplicaSet(rs)
    }
}

impl From<Service> for Object {
    fn from(svc: Service) -> Self {
        Object::Service(svc)
    }
}

/// Wire shape for list responses: `{"items": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List<T> {
    pub items: Vec<T>,
}
