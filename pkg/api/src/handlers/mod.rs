pub mod pods;
pub mod replicasets;
pub mod services;

use serde::de::DeserializeOwned;

use crate::error::ApiError;
use pkg_types::Error;

/// Decode a request body. Any schema mismatch is a client error, not a
/// server one.
pub(crate) fn parse<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError(Error::Validation(e.to_string())))
}

pub(crate) fn internal(what: &str) -> ApiError {
    ApiError(Error::Internal(format!(
        "store returned an unexpected object for {}",
        what
    )))
}
