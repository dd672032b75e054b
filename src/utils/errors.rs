// src/utils/errors.rs
//! Error types for the fleet engine
//!
//! Per-instance transport failures are captured as `InstanceErrorData`
//! inside the creation/deletion retry loop and never surface directly;
//! only aggregate outcomes (`CreationExhausted`, `DeletionIncomplete`)
//! or fatal conditions (`RegistryUnavailable`) reach the caller.

use thiserror::Error;

/// Fleet engine errors
#[derive(Debug, Error)]
pub enum FleetError {
    /// A requested state transition is invalid given the current status
    /// (e.g. start while RUNNING, kill while IDLE). Recoverable by the
    /// caller inspecting status and retrying the correct operation.
    #[error("invalid simulation state: {0}")]
    SimulationException(String),

    /// The shared registry store could not be reached. Fatal for the
    /// current call, never retried internally.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// No simulation record exists under the given id.
    #[error("simulation '{0}' not found")]
    SimulationNotFound(String),

    /// The backup collaborator rejected a save. Aborts create/restart
    /// before any instance is contacted.
    #[error("backup persistence failed: {0}")]
    BackupPersistenceFailed(String),

    /// No IDLE instance was available to place a shard on.
    #[error("no idle instances available")]
    NoIdleInstances,

    /// The creation protocol exhausted its attempt budget.
    #[error("simulation creation failed after {attempts} attempts")]
    CreationExhausted { attempts: u32 },

    /// Some instances still held shards after the deletion attempt
    /// budget; the simulation record has been marked BROKEN. Retryable.
    #[error("simulation deletion incomplete after {attempts} attempts")]
    DeletionIncomplete { attempts: u32 },

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Malformed request or response payload at an HTTP boundary.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FleetError>;
