pub mod engine;
pub mod pod;
pub mod replicaset;
pub mod service;

pub use engine::{Engine, EngineHandle, Reconciler};
pub use pod::PodLifecycleManager;
pub use replicaset::ReplicaSetController;
pub use service::ServiceController;
