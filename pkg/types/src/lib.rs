pub mod error;
pub mod meta;
pub mod object;
pub mod pod;
pub mod replicaset;
pub mod selector;
pub mod service;
pub mod validate;

pub use error::{Error, Result};
