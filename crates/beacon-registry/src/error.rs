//! Error types for the service registry.

use thiserror::Error;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The per-service registration lock could not be obtained in time.
    #[error("failed to acquire registration lock for service: {0}")]
    LockAcquisition(String),

    /// Lock backend failure other than contention.
    #[error("lock error: {0}")]
    Lock(#[from] beacon_state::LockError),

    /// Store failure surfaced from `register` itself; everything after a
    /// successful registration degrades internally instead.
    #[error("store error: {0}")]
    Store(#[from] beacon_state::StoreError),

    /// Registration record could not be serialised.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Another live key carries this instance id.
    #[error("stale registration conflict for instance: {0}")]
    StaleConflict(String),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
