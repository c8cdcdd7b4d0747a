//! Coordinator error types.

use thiserror::Error;

use crate::traits::{CleanupError, RecoveryError, TransactionError};

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors surfaced by the coordinator's fallible method surfaces.
///
/// Query failures are not errors in this sense: they are recorded on the
/// controller (first write wins) and drive the state machine to FAILED.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The session has no prepared statement with the given name.
    #[error("prepared statement not found: {0}")]
    PreparedStatementNotFound(String),

    /// Transaction finalization failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// End-of-query cleanup failed.
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// The recovery collaborator could not reschedule the query.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}
