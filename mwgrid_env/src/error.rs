//! Error types for the mwgrid environment abstraction.

use crate::types::{EntityId, RollbackRequest, Time, VariableId};
use thiserror::Error;

/// Errors raised by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport detected a time conflict for an agent.
    ///
    /// This is the one error that is expected during normal operation.
    #[error("Rollback requested: {0}")]
    Rollback(RollbackRequest),

    /// No shared variable is registered under this identifier.
    #[error("Shared variable {variable} of entity {entity} not found")]
    NotFound { entity: EntityId, variable: VariableId },

    /// A shared variable was registered twice.
    #[error("Shared variable {variable} of entity {entity} already exists")]
    AlreadyExists { entity: EntityId, variable: VariableId },

    /// A read asked for a time before the variable's retained history.
    #[error("Variable {variable} of entity {entity} has no value at time {time}")]
    BeforeHistory {
        entity: EntityId,
        variable: VariableId,
        time: Time,
    },

    /// The transport has not been initialized (or its coordinator is not up yet).
    #[error("Transport not initialized")]
    NotInitialized,

    /// Connection-level failure (peer gone, channel closed, etc.)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The bootstrap file could not be produced or understood.
    #[error("Bootstrap error: {0}")]
    BootstrapError(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Creates a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Creates a bootstrap error.
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::BootstrapError(msg.into())
    }

    /// Returns the rollback request if this error is a conflict signal.
    pub fn rollback_request(&self) -> Option<RollbackRequest> {
        match self {
            Self::Rollback(request) => Some(*request),
            _ => None,
        }
    }
}

/// Errors raised while parsing textual values (`x:y` locations, typed values).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Invalid location '{0}', expected 'x:y'")]
    InvalidLocation(String),

    #[error("Invalid {kind} value '{text}'")]
    InvalidValue { kind: &'static str, text: String },

    #[error("Unknown value type tag '{0}'")]
    UnknownType(String),
}
