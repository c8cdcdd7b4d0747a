//! Memory pools and per-query memory watermarks.
//!
//! Watermarks are lock-free: currents are adjusted with `fetch_add` and
//! peaks raised with `fetch_max`, so each peak is monotonically
//! non-decreasing under racing producers. Readers get atomic per-field
//! snapshots but no consistent multi-field view.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifier of the memory pool a query is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryPoolId(String);

impl MemoryPoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The pool queries start in.
    pub fn general() -> Self {
        Self::new("general")
    }

    /// The pool the memory manager moves the largest query into under
    /// cluster-wide pressure.
    pub fn reserved() -> Self {
        Self::new("reserved")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryPoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pool assignment with a version that must strictly increase on every
/// reassignment; the controller rejects updates carrying a version at or
/// below the current one, so stale updates from the memory manager are
/// detected rather than applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedMemoryPoolId {
    pub id: MemoryPoolId,
    pub version: u64,
}

impl VersionedMemoryPoolId {
    pub fn initial() -> Self {
        Self {
            id: MemoryPoolId::general(),
            version: 0,
        }
    }
}

/// Atomic snapshot-free memory accounting for one query.
#[derive(Debug, Default)]
pub struct MemoryWatermarks {
    user: AtomicI64,
    revocable: AtomicI64,
    total: AtomicI64,
    peak_user: AtomicI64,
    peak_revocable: AtomicI64,
    peak_total: AtomicI64,
    peak_task_user: AtomicI64,
    peak_task_revocable: AtomicI64,
    peak_task_total: AtomicI64,
}

impl MemoryWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies deltas to the current counters and raises the peaks.
    ///
    /// Each peak is updated independently; no cross-field ordering is
    /// guaranteed between, say, `peak_user` and `peak_total`.
    pub fn update(
        &self,
        delta_user: i64,
        delta_revocable: i64,
        delta_total: i64,
        task_user: i64,
        task_revocable: i64,
        task_total: i64,
    ) {
        let user = self.user.fetch_add(delta_user, Ordering::AcqRel) + delta_user;
        let revocable = self.revocable.fetch_add(delta_revocable, Ordering::AcqRel) + delta_revocable;
        let total = self.total.fetch_add(delta_total, Ordering::AcqRel) + delta_total;

        self.peak_user.fetch_max(user, Ordering::AcqRel);
        self.peak_revocable.fetch_max(revocable, Ordering::AcqRel);
        self.peak_total.fetch_max(total, Ordering::AcqRel);
        self.peak_task_user.fetch_max(task_user, Ordering::AcqRel);
        self.peak_task_revocable
            .fetch_max(task_revocable, Ordering::AcqRel);
        self.peak_task_total.fetch_max(task_total, Ordering::AcqRel);
    }

    pub fn current_user(&self) -> i64 {
        self.user.load(Ordering::Acquire)
    }

    pub fn current_revocable(&self) -> i64 {
        self.revocable.load(Ordering::Acquire)
    }

    pub fn current_total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn peak_user(&self) -> i64 {
        self.peak_user.load(Ordering::Acquire)
    }

    pub fn peak_revocable(&self) -> i64 {
        self.peak_revocable.load(Ordering::Acquire)
    }

    pub fn peak_total(&self) -> i64 {
        self.peak_total.load(Ordering::Acquire)
    }

    pub fn peak_task_user(&self) -> i64 {
        self.peak_task_user.load(Ordering::Acquire)
    }

    pub fn peak_task_revocable(&self) -> i64 {
        self.peak_task_revocable.load(Ordering::Acquire)
    }

    pub fn peak_task_total(&self) -> i64 {
        self.peak_task_total.load(Ordering::Acquire)
    }
}
