//! Error types for projectq.

use crate::model::{State, WorkId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(WorkId),

    /// The conditional update lost: persisted state was not `expected`.
    #[error("state conflict on {id}: expected {expected}, found {actual}")]
    StateConflict {
        id: WorkId,
        expected: State,
        actual: State,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("persistence unavailable: {0}")]
    Persistence(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The row exists (state CREATED) but no message references it.
    #[error("work item {id} created but not enqueued: {reason}")]
    NotEnqueued { id: WorkId, reason: String },

    #[error("work failed: {0}")]
    WorkFailure(String),

    #[error("no handler registered for kind '{0}'")]
    UnknownKind(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Storage-level failure, as opposed to a logical outcome like a conflict.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Database(_))
    }

    pub fn is_broker_unavailable(&self) -> bool {
        matches!(self, Error::BrokerUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
