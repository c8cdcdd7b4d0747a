//! # gabbro-types: Core types for `Gabbro`
//!
//! This crate contains shared types used across the `Gabbro` coordinator:
//! - Entity IDs ([`QueryId`], [`StageId`], [`TaskId`], [`TransactionId`])
//! - Resource groups ([`ResourceGroupId`])
//! - Lifecycle states ([`QueryState`], [`StageState`], [`TaskState`], [`RecoveryState`])
//! - Failure classification ([`ErrorKind`], [`ErrorCode`], [`ExecutionFailure`])
//! - Diagnostics ([`Warning`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Entity IDs
// ============================================================================

/// Unique identifier for a query.
///
/// Query ids are assigned by the dispatcher and are opaque to the
/// coordinator; the conventional format is `yyyyMMdd_HHmmss_index_cluster`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier for a stage within a query's distributed plan.
///
/// Displays as `<query_id>.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId {
    pub query_id: QueryId,
    pub id: u32,
}

impl StageId {
    pub fn new(query_id: QueryId, id: u32) -> Self {
        Self { query_id, id }
    }
}

impl Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query_id, self.id)
    }
}

/// Identifier for a task executing part of a stage on a worker.
///
/// Displays as `<stage_id>.<id>.<attempt>`. The attempt number
/// distinguishes re-executions after recovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub stage_id: StageId,
    pub id: u32,
    pub attempt: u32,
}

impl TaskId {
    pub fn new(stage_id: StageId, id: u32, attempt: u32) -> Self {
        Self {
            stage_id,
            id,
            attempt,
        }
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stage_id, self.id, self.attempt)
    }
}

/// Unique identifier for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a fresh random transaction id.
    pub fn create() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a resource group, a dot-separated path of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceGroupId(Vec<String>);

impl ResourceGroupId {
    pub fn new(segments: Vec<String>) -> Self {
        assert!(!segments.is_empty(), "resource group id must be non-empty");
        Self(segments)
    }

    /// Convenience constructor for a single-segment group.
    pub fn global(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

// ============================================================================
// Lifecycle States
// ============================================================================

/// The lifecycle state of a query.
///
/// Variants are declared in phase order; the derived `Ord` gives the
/// phase ordinal used by forward-only transition predicates. `Finished`
/// and `Failed` are terminal and absorb all further transitions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    /// Query has been accepted and is awaiting dispatch.
    Queued,
    /// Query is waiting for resource-group capacity.
    WaitingForResources,
    /// Query is being handed to a coordinator.
    Dispatching,
    /// Query is being planned.
    Planning,
    /// Stages are being scheduled.
    Starting,
    /// Tasks are executing.
    Running,
    /// Execution is paused; tasks retain their state.
    Suspended,
    /// A running query is being rescheduled after a node snapshot.
    Recovering,
    /// Output is being finalized and the transaction resolved.
    Finishing,
    /// Terminal: the query completed successfully.
    Finished,
    /// Terminal: the query failed or was canceled.
    Failed,
}

impl QueryState {
    /// Returns true for the absorbing terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Returns true once the query has stopped making progress.
    pub fn is_done(self) -> bool {
        self.is_terminal()
    }
}

impl Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::WaitingForResources => "WAITING_FOR_RESOURCES",
            Self::Dispatching => "DISPATCHING",
            Self::Planning => "PLANNING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
            Self::Recovering => "RECOVERING",
            Self::Finishing => "FINISHING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// The state of a stage, as reported by the distributed scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Planned,
    Scheduling,
    Scheduled,
    Running,
    Recovering,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl StageState {
    /// Returns true once the stage can make no further progress.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Aborted | Self::Failed
        )
    }

    /// Returns true if every split of the stage has been placed and the
    /// stage is either executing or already done.
    pub fn is_running_or_done(self) -> bool {
        matches!(self, Self::Running) || self.is_done()
    }
}

impl Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Planned => "PLANNED",
            Self::Scheduling => "SCHEDULING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Recovering => "RECOVERING",
            Self::Finished => "FINISHED",
            Self::Canceled => "CANCELED",
            Self::Aborted => "ABORTED",
            Self::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// The state of a single task, as reported by the task manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Planned,
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Aborted | Self::Failed
        )
    }
}

/// The state of the recovery collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    /// No recovery in progress.
    Inactive,
    /// A node-level snapshot completed; the query should stop and reschedule.
    StoppingForReschedule,
    /// The query is being rescheduled.
    Rescheduling,
}

// ============================================================================
// Failure Classification
// ============================================================================

/// Broad classification of a query failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The request itself was invalid.
    User,
    /// The user (or an administrator) canceled the query.
    UserCanceled,
    /// A bug or unexpected condition inside the engine.
    Internal,
    /// The cluster lacked memory or other capacity.
    InsufficientResources,
    /// A connector or external system failed.
    External,
}

/// A stable, named failure code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: u32,
    pub name: String,
    pub kind: ErrorKind,
}

impl ErrorCode {
    pub fn new(code: u32, name: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            code,
            name: name.into(),
            kind,
        }
    }

    pub fn generic_user_error() -> Self {
        Self::new(0, "GENERIC_USER_ERROR", ErrorKind::User)
    }

    pub fn user_canceled() -> Self {
        Self::new(1, "USER_CANCELED", ErrorKind::UserCanceled)
    }

    pub fn generic_internal_error() -> Self {
        Self::new(65536, "GENERIC_INTERNAL_ERROR", ErrorKind::Internal)
    }

    pub fn exceeded_memory_limit() -> Self {
        Self::new(
            131072,
            "EXCEEDED_MEMORY_LIMIT",
            ErrorKind::InsufficientResources,
        )
    }

    pub fn transaction_failed() -> Self {
        Self::new(65554, "TRANSACTION_FAILED", ErrorKind::Internal)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An immutable record of why a query failed.
///
/// The coordinator captures the first failure it observes and ignores
/// later ones, so the record never changes once published.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ExecutionFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The synthetic failure recorded for canceled queries.
    pub fn user_canceled() -> Self {
        Self::new(ErrorCode::user_canceled(), "Query was canceled by user")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::generic_internal_error(), message)
    }

    pub fn is_user_canceled(&self) -> bool {
        self.code.kind == ErrorKind::UserCanceled
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// A non-fatal diagnostic surfaced alongside query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: u32,
    pub message: String,
}

impl Warning {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests;
