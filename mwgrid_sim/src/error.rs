//! Error types for the scenario harness.

use mwgrid_core::KernelError;
use mwgrid_env::TransportError;
use thiserror::Error;

/// Errors raised while setting up or running a scenario.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// A worker rank's thread panicked or could not be joined.
    #[error("Worker rank {0} failed")]
    WorkerFailed(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for the harness.
pub type SimResult<T> = Result<T, SimError>;
