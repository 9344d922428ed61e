use thiserror::Error;

use crate::meta::ResourceKey;

/// Error kinds shared across the control plane.
///
/// The API layer maps each kind onto an HTTP status; controllers treat
/// `NotFound` as success during cleanup and never abort the process on an
/// object-local failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Target object absent.
    #[error("{0} not found")]
    NotFound(ResourceKey),

    /// Key collision on create.
    #[error("{0} already exists")]
    AlreadyExists(ResourceKey),

    /// Schema or semantic violation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Runtime glitch worth retrying with backoff.
    #[error("transient runtime failure: {0}")]
    RuntimeTransient(String),

    /// Runtime misconfiguration unlikely to self-heal (e.g. an image that
    /// cannot be pulled). Recorded in the object's status conditions and
    /// not retried on the same object.
    #[error("{reason}: {message}")]
    RuntimeFatal { reason: String, message: String },

    /// Unexpected invariant breach.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a reconcile hitting this error should be retried by the
    /// engine's backoff path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RuntimeTransient(_) | Error::Internal(_))
    }
}
