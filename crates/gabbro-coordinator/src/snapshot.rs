//! Immutable query snapshot value objects.
//!
//! Stage and task telemetry is supplied by the distributed scheduler; the
//! controller only composes and sums it. All types here are plain data:
//! cloning a snapshot never observes live state.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gabbro_types::{
    ExecutionFailure, QueryId, QueryState, ResourceGroupId, StageId, StageState, TaskId, TaskState,
    TransactionId, Warning,
};

use crate::memory::VersionedMemoryPoolId;
use crate::session::Session;

// ============================================================================
// Plan & Task Telemetry (supplied)
// ============================================================================

/// The slice of a plan fragment the controller cares about: which of its
/// partitioned sources read from tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub fragment_id: u32,
    /// Plan node ids of partitioned table-scan sources in this fragment.
    pub table_scan_sources: Vec<u32>,
}

impl PlanFragment {
    pub fn new(fragment_id: u32) -> Self {
        Self {
            fragment_id,
            table_scan_sources: Vec::new(),
        }
    }

    pub fn with_table_scan_source(mut self, node_id: u32) -> Self {
        self.table_scan_sources.push(node_id);
        self
    }

    /// True if raw-input counters of this fragment's stage should roll up
    /// into the query totals.
    pub fn has_table_scan_source(&self) -> bool {
        !self.table_scan_sources.is_empty()
    }
}

/// Per-operator roll-up reported by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    pub operator_id: u32,
    pub operator_kind: String,
    pub input_rows: u64,
    pub input_bytes: u64,
    pub output_rows: u64,
    pub output_bytes: u64,
}

/// One task of a stage, as reported by the task manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub state: TaskState,
}

/// Counters reported by one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,

    pub total_scheduled_time: Duration,
    pub total_cpu_time: Duration,
    pub total_blocked_time: Duration,
    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<String>,

    pub raw_input_bytes: u64,
    pub raw_input_rows: u64,
    pub processed_input_bytes: u64,
    pub processed_input_rows: u64,
    pub output_bytes: u64,
    pub output_rows: u64,

    pub full_gc_count: u64,
    pub full_gc_time: Duration,

    pub operator_summaries: Vec<OperatorStats>,
}

/// A stage subtree of the distributed plan, with telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub state: StageState,
    pub plan: Option<PlanFragment>,
    pub stats: StageStats,
    pub tasks: Vec<TaskInfo>,
    pub sub_stages: Vec<StageInfo>,
}

impl StageInfo {
    /// All stages of the tree in pre-order.
    pub fn all_stages(&self) -> Vec<&StageInfo> {
        let mut stages = Vec::new();
        self.collect(&mut stages);
        stages
    }

    fn collect<'a>(&'a self, into: &mut Vec<&'a StageInfo>) {
        into.push(self);
        for sub in &self.sub_stages {
            sub.collect(into);
        }
    }

    /// True once every stage in the tree is done.
    pub fn is_complete(&self) -> bool {
        self.all_stages().iter().all(|stage| stage.state.is_done())
    }

    /// A structurally shrunken copy: same scalars, no plan, no tasks, no
    /// sub-stages, no operator summaries.
    fn pruned(&self) -> StageInfo {
        let mut stats = self.stats.clone();
        stats.operator_summaries = Vec::new();
        StageInfo {
            stage_id: self.stage_id.clone(),
            state: self.state,
            plan: None,
            stats,
            tasks: Vec::new(),
            sub_stages: Vec::new(),
        }
    }
}

// ============================================================================
// Query Stats (assembled)
// ============================================================================

/// Full per-query statistics: lifecycle timings from the controller plus
/// counters rolled up from the stage tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    pub create_time: Option<DateTime<Utc>>,
    pub execution_start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,

    pub elapsed_time: Duration,
    pub queued_time: Duration,
    pub resource_waiting_time: Duration,
    pub dispatching_time: Duration,
    pub planning_time: Duration,
    pub analysis_time: Duration,
    pub execution_time: Duration,
    pub finishing_time: Duration,

    pub total_tasks: u64,
    pub running_tasks: u64,
    pub completed_tasks: u64,

    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,

    pub raw_input_bytes: u64,
    pub raw_input_rows: u64,
    pub processed_input_bytes: u64,
    pub processed_input_rows: u64,
    pub output_bytes: u64,
    pub output_rows: u64,

    pub user_memory_bytes: i64,
    pub revocable_memory_bytes: i64,
    pub total_memory_bytes: i64,
    pub peak_user_memory_bytes: i64,
    pub peak_revocable_memory_bytes: i64,
    pub peak_total_memory_bytes: i64,
    pub peak_task_user_memory_bytes: i64,
    pub peak_task_revocable_memory_bytes: i64,
    pub peak_task_total_memory_bytes: i64,

    pub total_scheduled_time: Duration,
    pub total_cpu_time: Duration,
    pub total_blocked_time: Duration,
    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<String>,

    pub full_gc_count: u64,
    pub full_gc_time: Duration,

    pub operator_summaries: Vec<OperatorStats>,
}

impl QueryStats {
    /// Folds the supplied stage tree into these stats.
    ///
    /// Raw-input counters accumulate only for stages whose plan contains a
    /// table-scan partitioned source. `fully_blocked` is the conjunction
    /// over stages that are still making progress.
    pub(crate) fn roll_up_stages(&mut self, root: &StageInfo) {
        let mut fully_blocked = true;
        for stage in root.all_stages() {
            self.total_tasks += stage.tasks.len() as u64;
            self.running_tasks += stage
                .tasks
                .iter()
                .filter(|task| task.state == TaskState::Running)
                .count() as u64;
            self.completed_tasks += stage
                .tasks
                .iter()
                .filter(|task| task.state.is_done())
                .count() as u64;

            let stats = &stage.stats;
            self.total_drivers += stats.total_drivers;
            self.queued_drivers += stats.queued_drivers;
            self.running_drivers += stats.running_drivers;
            self.completed_drivers += stats.completed_drivers;

            self.total_scheduled_time += stats.total_scheduled_time;
            self.total_cpu_time += stats.total_cpu_time;
            self.total_blocked_time += stats.total_blocked_time;
            if !stage.state.is_done() {
                fully_blocked &= stats.fully_blocked;
                self.blocked_reasons
                    .extend(stats.blocked_reasons.iter().cloned());
            }

            if stage
                .plan
                .as_ref()
                .is_some_and(PlanFragment::has_table_scan_source)
            {
                self.raw_input_bytes += stats.raw_input_bytes;
                self.raw_input_rows += stats.raw_input_rows;
            }
            self.processed_input_bytes += stats.processed_input_bytes;
            self.processed_input_rows += stats.processed_input_rows;
            self.output_bytes += stats.output_bytes;
            self.output_rows += stats.output_rows;

            self.full_gc_count += stats.full_gc_count;
            self.full_gc_time += stats.full_gc_time;

            self.operator_summaries
                .extend(stats.operator_summaries.iter().cloned());
        }
        self.fully_blocked = fully_blocked;
    }
}

// ============================================================================
// Inputs & Output
// ============================================================================

/// A table read by the query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryInput {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

/// The table the query writes, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

// ============================================================================
// Basic Snapshot
// ============================================================================

/// Rolled-up stage counters supplied by the scheduler for the lightweight
/// snapshot path, where no full stage tree is materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicStageStats {
    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,
    pub raw_input_bytes: u64,
    pub raw_input_rows: u64,
    pub total_cpu_time: Duration,
    pub total_scheduled_time: Duration,
    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<String>,
}

/// The lightweight stats block of [`BasicQueryInfo`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicQueryStats {
    pub create_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub queued_time: Duration,
    pub elapsed_time: Duration,
    pub execution_time: Duration,

    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,

    pub raw_input_bytes: u64,
    pub raw_input_rows: u64,

    pub user_memory_bytes: i64,
    pub total_memory_bytes: i64,
    pub peak_user_memory_bytes: i64,
    pub peak_total_memory_bytes: i64,

    pub total_cpu_time: Duration,
    pub total_scheduled_time: Duration,
    pub fully_blocked: bool,
    pub blocked_reasons: BTreeSet<String>,
}

/// A lightweight, frequently-polled view of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicQueryInfo {
    pub query_id: QueryId,
    pub session: Session,
    pub resource_group_id: ResourceGroupId,
    pub state: QueryState,
    pub memory_pool: VersionedMemoryPoolId,
    pub self_uri: String,
    pub query_text: String,
    pub prepared_query: Option<String>,
    pub update_type: Option<String>,
    pub stats: BasicQueryStats,
    pub failure: Option<ExecutionFailure>,
}

// ============================================================================
// Full Snapshot
// ============================================================================

/// The complete immutable view of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: QueryId,
    pub session: Session,
    pub state: QueryState,
    pub memory_pool: VersionedMemoryPoolId,
    /// True once the root stage exists and every stage has all of its
    /// splits placed (running or already done).
    pub scheduled: bool,
    pub self_uri: String,
    pub query_text: String,
    pub prepared_query: Option<String>,
    pub update_type: Option<String>,
    pub stats: QueryStats,

    pub set_catalog: Option<String>,
    pub set_schema: Option<String>,
    pub set_path: Option<String>,
    pub set_session_properties: std::collections::BTreeMap<String, String>,
    pub reset_session_properties: BTreeSet<String>,
    pub set_roles: std::collections::BTreeMap<String, String>,
    pub added_prepared_statements: std::collections::BTreeMap<String, String>,
    pub deallocated_prepared_statements: BTreeSet<String>,
    pub started_transaction_id: Option<TransactionId>,
    pub clear_transaction_id: bool,

    pub output_stage: Option<StageInfo>,
    pub failure: Option<ExecutionFailure>,
    pub warnings: Vec<Warning>,
    pub inputs: Vec<QueryInput>,
    pub output: Option<QueryOutput>,
    pub resource_group_id: ResourceGroupId,

    /// True when this snapshot is complete and will never grow: the query
    /// is terminal and every stage (if any were created) is done.
    pub final_info: bool,
}

impl QueryInfo {
    /// A structurally shrunken copy for long-term retention: plan
    /// fragments, task lists, sub-stage lists, and operator summaries are
    /// dropped; every scalar counter and timing survives unchanged.
    pub fn pruned(&self) -> QueryInfo {
        let mut pruned = self.clone();
        pruned.output_stage = self.output_stage.as_ref().map(StageInfo::pruned);
        pruned.stats.operator_summaries = Vec::new();
        pruned
    }

    /// Rough retained size. Recomputed on each call; snapshots are shared
    /// immutably so callers can cache the result if they poll often.
    pub fn estimated_size_bytes(&self) -> usize {
        let strings = self.query_text.len()
            + self.prepared_query.as_deref().map_or(0, str::len)
            + self
                .added_prepared_statements
                .iter()
                .map(|(name, sql)| name.len() + sql.len())
                .sum::<usize>();
        let stages = self
            .output_stage
            .as_ref()
            .map_or(0, |root| root.all_stages().len());
        let tasks: usize = self
            .output_stage
            .as_ref()
            .map_or(0, |root| root.all_stages().iter().map(|s| s.tasks.len()).sum());
        let operators = self.stats.operator_summaries.len();

        std::mem::size_of::<QueryInfo>()
            + strings
            + stages * std::mem::size_of::<StageInfo>()
            + tasks * std::mem::size_of::<TaskInfo>()
            + operators * std::mem::size_of::<OperatorStats>()
    }
}
