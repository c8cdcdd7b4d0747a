//! Collaborator contracts the controller depends on.
//!
//! The controller is generic over these seams so production wiring and
//! tests can plug in different implementations. In-memory implementations
//! live here as well; they back unit tests and single-node deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use gabbro_types::{QueryId, RecoveryState, ResourceGroupId, TransactionId, Warning};

use crate::session::Session;

// ============================================================================
// Transaction Manager
// ============================================================================

/// Error raised by transaction finalization.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("abort failed: {0}")]
    AbortFailed(String),

    #[error("unknown transaction: {0}")]
    Unknown(TransactionId),
}

/// Tracks transactions and finalizes them on the controller's behalf.
///
/// `commit` and `abort` are synchronous; the controller supplies the
/// asynchrony by enqueuing them on its notification executor.
pub trait TransactionManager: Send + Sync {
    /// Opens a transaction and returns its id.
    fn begin(&self, auto_commit: bool) -> TransactionId;

    /// Returns true while the transaction is active.
    fn exists(&self, id: TransactionId) -> bool;

    fn is_auto_commit(&self, id: TransactionId) -> bool;

    fn commit(&self, id: TransactionId) -> Result<(), TransactionError>;

    fn abort(&self, id: TransactionId) -> Result<(), TransactionError>;

    /// Marks the transaction failed; it can only be rolled back afterwards.
    fn fail(&self, id: TransactionId);
}

/// Lifecycle status of a transaction in [`InMemoryTransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
    Failed,
}

struct TransactionEntry {
    auto_commit: bool,
    status: TransactionStatus,
}

/// A transaction manager holding all state in memory.
///
/// Supports failure injection for commit and abort so finalization error
/// paths can be exercised.
#[derive(Default)]
pub struct InMemoryTransactionManager {
    transactions: Mutex<HashMap<TransactionId, TransactionEntry>>,
    next_commit_failure: Mutex<Option<String>>,
    next_abort_failure: Mutex<Option<String>>,
}

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `commit` call fail with the given message.
    pub fn inject_commit_failure(&self, message: impl Into<String>) {
        *lock(&self.next_commit_failure) = Some(message.into());
    }

    /// Makes the next `abort` call fail with the given message.
    pub fn inject_abort_failure(&self, message: impl Into<String>) {
        *lock(&self.next_abort_failure) = Some(message.into());
    }

    /// Returns the status of a transaction, if known.
    pub fn status(&self, id: TransactionId) -> Option<TransactionStatus> {
        lock(&self.transactions).get(&id).map(|entry| entry.status)
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn begin(&self, auto_commit: bool) -> TransactionId {
        let id = TransactionId::create();
        lock(&self.transactions).insert(
            id,
            TransactionEntry {
                auto_commit,
                status: TransactionStatus::Active,
            },
        );
        id
    }

    fn exists(&self, id: TransactionId) -> bool {
        lock(&self.transactions)
            .get(&id)
            .is_some_and(|entry| entry.status == TransactionStatus::Active)
    }

    fn is_auto_commit(&self, id: TransactionId) -> bool {
        lock(&self.transactions)
            .get(&id)
            .is_some_and(|entry| entry.auto_commit)
    }

    fn commit(&self, id: TransactionId) -> Result<(), TransactionError> {
        if let Some(message) = lock(&self.next_commit_failure).take() {
            if let Some(entry) = lock(&self.transactions).get_mut(&id) {
                entry.status = TransactionStatus::Failed;
            }
            return Err(TransactionError::CommitFailed(message));
        }
        let mut transactions = lock(&self.transactions);
        let entry = transactions
            .get_mut(&id)
            .ok_or(TransactionError::Unknown(id))?;
        entry.status = TransactionStatus::Committed;
        Ok(())
    }

    fn abort(&self, id: TransactionId) -> Result<(), TransactionError> {
        if let Some(message) = lock(&self.next_abort_failure).take() {
            return Err(TransactionError::AbortFailed(message));
        }
        let mut transactions = lock(&self.transactions);
        let entry = transactions
            .get_mut(&id)
            .ok_or(TransactionError::Unknown(id))?;
        entry.status = TransactionStatus::Aborted;
        Ok(())
    }

    fn fail(&self, id: TransactionId) {
        if let Some(entry) = lock(&self.transactions).get_mut(&id) {
            entry.status = TransactionStatus::Failed;
        }
    }
}

// ============================================================================
// Resource Group Manager
// ============================================================================

/// Answers the two questions the controller asks about resource groups.
pub trait ResourceGroupManager: Send + Sync {
    fn is_registered(&self, group: &ResourceGroupId) -> bool;

    /// Soft memory reservation for the group in bytes; `None` means
    /// unlimited.
    fn soft_reserved_memory(&self, group: &ResourceGroupId) -> Option<u64>;
}

/// A fixed table of resource groups.
#[derive(Default)]
pub struct StaticResourceGroupManager {
    groups: Mutex<HashMap<ResourceGroupId, Option<u64>>>,
}

impl StaticResourceGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, group: ResourceGroupId, soft_reserved_memory: Option<u64>) -> Self {
        lock(&self.groups).insert(group, soft_reserved_memory);
        self
    }
}

impl ResourceGroupManager for StaticResourceGroupManager {
    fn is_registered(&self, group: &ResourceGroupId) -> bool {
        lock(&self.groups).contains_key(group)
    }

    fn soft_reserved_memory(&self, group: &ResourceGroupId) -> Option<u64> {
        lock(&self.groups).get(group).copied().flatten()
    }
}

// ============================================================================
// Cleanup Handler
// ============================================================================

/// Error raised by end-of-query cleanup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cleanup failed: {message}")]
pub struct CleanupError {
    pub message: String,
}

impl CleanupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Releases per-query resources held by external collaborators: cached
/// metadata and the worker-side query context.
pub trait CleanupHandler: Send + Sync {
    fn cleanup_query(&self, session: &Session) -> Result<(), CleanupError>;

    fn cleanup_context(&self, query_id: &QueryId) -> Result<(), CleanupError>;
}

/// A cleanup handler with nothing to clean.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCleanupHandler;

impl CleanupHandler for NoopCleanupHandler {
    fn cleanup_query(&self, _session: &Session) -> Result<(), CleanupError> {
        Ok(())
    }

    fn cleanup_context(&self, _query_id: &QueryId) -> Result<(), CleanupError> {
        Ok(())
    }
}

// ============================================================================
// Recovery Manager
// ============================================================================

/// Error raised when a query cannot be rescheduled after recovery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("reschedule failed: {message}")]
pub struct RecoveryError {
    pub message: String,
}

impl RecoveryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Reports node-snapshot recovery state and reschedules stopped queries.
pub trait RecoveryManager: Send + Sync {
    fn state(&self) -> RecoveryState;

    fn reschedule_query(&self) -> Result<(), RecoveryError>;
}

/// A recovery manager whose state is set explicitly.
pub struct StaticRecoveryManager {
    state: Mutex<RecoveryState>,
    next_reschedule_failure: Mutex<Option<String>>,
    reschedules: AtomicUsize,
}

impl StaticRecoveryManager {
    pub fn new(state: RecoveryState) -> Self {
        Self {
            state: Mutex::new(state),
            next_reschedule_failure: Mutex::new(None),
            reschedules: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: RecoveryState) {
        *lock(&self.state) = state;
    }

    pub fn inject_reschedule_failure(&self, message: impl Into<String>) {
        *lock(&self.next_reschedule_failure) = Some(message.into());
    }

    pub fn reschedule_count(&self) -> usize {
        self.reschedules.load(Ordering::SeqCst)
    }
}

impl Default for StaticRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryState::Inactive)
    }
}

impl RecoveryManager for StaticRecoveryManager {
    fn state(&self) -> RecoveryState {
        *lock(&self.state)
    }

    fn reschedule_query(&self) -> Result<(), RecoveryError> {
        if let Some(message) = lock(&self.next_reschedule_failure).take() {
            return Err(RecoveryError::new(message));
        }
        self.reschedules.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Warning Collector
// ============================================================================

/// Accumulates non-fatal diagnostics surfaced in query snapshots.
pub trait WarningCollector: Send + Sync {
    fn add(&self, warning: Warning);

    fn warnings(&self) -> Vec<Warning>;
}

/// A warning collector backed by a vector.
#[derive(Default)]
pub struct StackedWarningCollector {
    warnings: Mutex<Vec<Warning>>,
}

impl StackedWarningCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WarningCollector for StackedWarningCollector {
    fn add(&self, warning: Warning) {
        lock(&self.warnings).push(warning);
    }

    fn warnings(&self) -> Vec<Warning> {
        lock(&self.warnings).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_commit_transaction_lifecycle() {
        let manager = InMemoryTransactionManager::new();
        let id = manager.begin(true);

        assert!(manager.exists(id));
        assert!(manager.is_auto_commit(id));

        manager.commit(id).unwrap();
        assert!(!manager.exists(id));
        assert_eq!(manager.status(id), Some(TransactionStatus::Committed));
    }

    #[test]
    fn injected_commit_failure_fails_transaction() {
        let manager = InMemoryTransactionManager::new();
        let id = manager.begin(true);
        manager.inject_commit_failure("connector rejected commit");

        let error = manager.commit(id).unwrap_err();
        assert_eq!(
            error,
            TransactionError::CommitFailed("connector rejected commit".into())
        );
        assert_eq!(manager.status(id), Some(TransactionStatus::Failed));

        // The injection is one-shot.
        let id2 = manager.begin(true);
        manager.commit(id2).unwrap();
    }

    #[test]
    fn throttling_inputs_from_resource_groups() {
        let group = ResourceGroupId::global("etl");
        let manager = StaticResourceGroupManager::new().with_group(group.clone(), Some(1 << 30));

        assert!(manager.is_registered(&group));
        assert_eq!(manager.soft_reserved_memory(&group), Some(1 << 30));

        let unlimited = ResourceGroupId::global("adhoc");
        assert!(!manager.is_registered(&unlimited));
        assert_eq!(manager.soft_reserved_memory(&unlimited), None);
    }

    #[test]
    fn recovery_manager_reports_and_counts() {
        let manager = StaticRecoveryManager::default();
        assert_eq!(manager.state(), RecoveryState::Inactive);

        manager.set_state(RecoveryState::StoppingForReschedule);
        assert_eq!(manager.state(), RecoveryState::StoppingForReschedule);

        manager.reschedule_query().unwrap();
        assert_eq!(manager.reschedule_count(), 1);

        manager.inject_reschedule_failure("no capacity");
        assert!(manager.reschedule_query().is_err());
        assert_eq!(manager.reschedule_count(), 1);
    }
}
