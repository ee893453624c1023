//! Error types for the simulation kernel.

use crate::shared_store::Identifier;
use mwgrid_env::{RollbackRequest, Time, TransportError, ValueType, VariableId};
use thiserror::Error;

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors raised by the kernel.
///
/// Only [`KernelError::Rollback`] is part of normal operation: the scheduler
/// catches it and rewinds the agent. Everything else is a contract violation
/// or an infrastructure failure and aborts the run.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A write hit a time that is already taken; the agent must rewind.
    #[error("Rollback requested: {0}")]
    Rollback(RollbackRequest),

    /// Variable unknown to the store it was routed to, or read across
    /// entities while private.
    #[error("Invalid variable {variable}: {reason}")]
    InvalidVariable {
        variable: VariableId,
        reason: &'static str,
    },

    /// Declared and actual value types differ.
    #[error("Type mismatch on variable {variable}: declared {expected}, got {found}")]
    TypeMismatch {
        variable: VariableId,
        expected: ValueType,
        found: ValueType,
    },

    /// Shared identifier is not registered.
    #[error("Shared variable {0} not found")]
    NotFound(Identifier),

    /// Shared identifier registered twice.
    #[error("Shared variable {0} already exists")]
    AlreadyExists(Identifier),

    /// Read before the earliest retained time of a cell.
    #[error("No value at time {time} (earliest retained time is {earliest})")]
    NotYetWritten { time: Time, earliest: Time },

    /// A private variable was written twice at the same local time.
    #[error("Private variable {variable} already written at time {time}")]
    DuplicateWrite { variable: VariableId, time: Time },

    /// Mailbox contents could not be decoded.
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Bootstrap file could not be laid out or parsed.
    #[error("Bootstrap error: {0}")]
    BootstrapError(String),

    /// Scheduler lifecycle misuse (no listeners, no agents, restarted...).
    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    /// Non-conflict failure from the transport.
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Local I/O failure (bootstrap file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Creates a scheduler error.
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::SchedulerError(msg.into())
    }

    /// Creates a bootstrap error.
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::BootstrapError(msg.into())
    }

    /// Creates a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::CodecError(msg.into())
    }

    /// Returns the rollback request if this is the conflict signal.
    pub fn rollback_request(&self) -> Option<RollbackRequest> {
        match self {
            Self::Rollback(request) => Some(*request),
            _ => None,
        }
    }

    /// True for the conflict signal.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback(_))
    }
}

impl From<TransportError> for KernelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rollback(request) => Self::Rollback(request),
            TransportError::NotFound { entity, variable } => {
                Self::NotFound(Identifier::new(entity, variable))
            }
            TransportError::AlreadyExists { entity, variable } => {
                Self::AlreadyExists(Identifier::new(entity, variable))
            }
            other => Self::Transport(other),
        }
    }
}
