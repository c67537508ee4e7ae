//! Operator error abstractions.

use thiserror::Error;

/// Errors returned from registry client operations.
///
/// Absence of a subject or version is not an error; clients surface it as
/// `Ok(None)` so the engine can drive registration from it.
#[derive(Clone, Debug, Error)]
pub enum RegistryError {
    /// The registry rejected the submitted schema content as invalid.
    ///
    /// Not retryable without a spec change; surfaced on resource status.
    #[error("registry rejected schema content: {0}")]
    MalformedSchema(String),
    /// Network failure, timeout, or an unexpected registry response.
    ///
    /// Always retryable and never written to resource status.
    #[error("transient registry error: {0}")]
    Transient(String),
}
