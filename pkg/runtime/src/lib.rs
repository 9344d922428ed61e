pub mod adapter;
pub mod fake;
pub mod podman;

pub use adapter::{
    ContainerState, RunSpec, RunningContainer, RuntimeAdapter, RuntimeError, RuntimeResult,
};
pub use fake::FakeRuntime;
pub use podman::PodmanRuntime;
