//! The query lifecycle controller.
//!
//! One [`QueryController`] owns a single query's state from submission to
//! terminal outcome: it drives the state machine, aggregates lifecycle
//! timings and memory watermarks, accumulates session mutations requested
//! by the query, finalizes the query's transaction, and assembles the
//! immutable snapshots external pollers consume.
//!
//! Transition methods return whether the transition fired. Terminal states
//! absorb everything: a concurrent FAILED preempts any in-flight
//! transition that has not yet committed, and nothing follows a terminal
//! state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use tracing::warn;

use gabbro_types::{
    ErrorCode, ExecutionFailure, QueryId, QueryState, RecoveryState, ResourceGroupId,
    TransactionId,
};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::executor::Executor;
use crate::memory::{MemoryWatermarks, VersionedMemoryPoolId};
use crate::output_publisher::{OutputPublisher, QueryOutputInfo};
use crate::phase_timer::PhaseTimer;
use crate::session::Session;
use crate::snapshot::{
    BasicQueryInfo, BasicQueryStats, BasicStageStats, QueryInfo, QueryInput, QueryOutput,
    QueryStats, StageInfo,
};
use crate::state_register::{StateRegister, StateValue};
use crate::traits::{
    CleanupError, CleanupHandler, InMemoryTransactionManager, NoopCleanupHandler, RecoveryManager,
    ResourceGroupManager, StackedWarningCollector, StaticRecoveryManager,
    StaticResourceGroupManager, TransactionManager, WarningCollector,
};

impl StateValue for QueryState {
    fn is_terminal(&self) -> bool {
        QueryState::is_terminal(*self)
    }
}

/// External collaborators the controller calls out to.
///
/// Defaults wire up the in-memory implementations, which is what
/// single-node deployments and tests want.
pub struct CoordinatorServices {
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub resource_group_manager: Arc<dyn ResourceGroupManager>,
    pub cleanup_handler: Arc<dyn CleanupHandler>,
    pub recovery_manager: Arc<dyn RecoveryManager>,
    pub warning_collector: Arc<dyn WarningCollector>,
}

impl Default for CoordinatorServices {
    fn default() -> Self {
        Self {
            transaction_manager: Arc::new(InMemoryTransactionManager::new()),
            resource_group_manager: Arc::new(StaticResourceGroupManager::new()),
            cleanup_handler: Arc::new(NoopCleanupHandler),
            recovery_manager: Arc::new(StaticRecoveryManager::default()),
            warning_collector: Arc::new(StackedWarningCollector::new()),
        }
    }
}

/// One-shot subscription for the final query snapshot.
struct FinalInfoSubscription {
    fired: AtomicBool,
    listener: Box<dyn Fn(Arc<QueryInfo>) + Send + Sync>,
}

/// Owns one query's lifecycle.
pub struct QueryController {
    query_id: QueryId,
    query_text: String,
    prepared_query: Option<String>,
    session: Session,
    self_uri: String,
    resource_group: ResourceGroupId,
    recovery_enabled: bool,

    state: StateRegister<QueryState>,
    timer: PhaseTimer,
    output: OutputPublisher,
    memory: MemoryWatermarks,
    memory_pool: RwLock<VersionedMemoryPoolId>,

    running_async: AtomicBool,

    // Session mutation accumulators. Readers may observe partial batches;
    // each field is independently consistent.
    set_catalog: Mutex<Option<String>>,
    set_schema: Mutex<Option<String>>,
    set_path: Mutex<Option<String>>,
    set_session_properties: Mutex<BTreeMap<String, String>>,
    reset_session_properties: Mutex<BTreeSet<String>>,
    set_roles: Mutex<BTreeMap<String, String>>,
    added_prepared_statements: Mutex<BTreeMap<String, String>>,
    deallocated_prepared_statements: Mutex<BTreeSet<String>>,

    started_transaction_id: Mutex<Option<TransactionId>>,
    clear_transaction: AtomicBool,

    update_type: Mutex<Option<String>>,
    failure_cause: OnceLock<ExecutionFailure>,
    inputs: Mutex<Vec<QueryInput>>,
    output_target: Mutex<Option<QueryOutput>>,

    /// The transaction this query runs in: the session's explicit one, or
    /// an auto-commit transaction opened at creation.
    transaction_id: TransactionId,

    cleanup_claimed: AtomicBool,
    final_info: RwLock<Option<Arc<QueryInfo>>>,
    final_listeners: Mutex<Vec<Arc<FinalInfoSubscription>>>,

    executor: Arc<dyn Executor>,
    transaction_manager: Arc<dyn TransactionManager>,
    resource_group_manager: Arc<dyn ResourceGroupManager>,
    cleanup_handler: Arc<dyn CleanupHandler>,
    recovery_manager: Arc<dyn RecoveryManager>,
    warning_collector: Arc<dyn WarningCollector>,
}

impl QueryController {
    /// Creates the controller for a newly submitted query.
    ///
    /// If the session carries no explicit transaction, an auto-commit
    /// transaction is opened here and finalized by the controller when the
    /// query reaches a terminal state.
    pub fn begin(
        session: Session,
        query_text: impl Into<String>,
        prepared_query: Option<String>,
        self_uri: impl Into<String>,
        resource_group: ResourceGroupId,
        services: CoordinatorServices,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let transaction_id = match session.transaction_id() {
            Some(id) => id,
            None => services.transaction_manager.begin(true),
        };
        let query_id = session.query_id().clone();
        let recovery_enabled = session.recovery_enabled();

        Arc::new(Self {
            query_text: query_text.into(),
            prepared_query,
            self_uri: self_uri.into(),
            resource_group,
            recovery_enabled,
            state: StateRegister::new(
                query_id.to_string(),
                QueryState::Queued,
                Arc::clone(&executor),
            ),
            timer: PhaseTimer::new(),
            output: OutputPublisher::new(Arc::clone(&executor)),
            memory: MemoryWatermarks::new(),
            memory_pool: RwLock::new(VersionedMemoryPoolId::initial()),
            running_async: AtomicBool::new(false),
            set_catalog: Mutex::new(None),
            set_schema: Mutex::new(None),
            set_path: Mutex::new(None),
            set_session_properties: Mutex::new(BTreeMap::new()),
            reset_session_properties: Mutex::new(BTreeSet::new()),
            set_roles: Mutex::new(BTreeMap::new()),
            added_prepared_statements: Mutex::new(BTreeMap::new()),
            deallocated_prepared_statements: Mutex::new(BTreeSet::new()),
            started_transaction_id: Mutex::new(None),
            clear_transaction: AtomicBool::new(false),
            update_type: Mutex::new(None),
            failure_cause: OnceLock::new(),
            inputs: Mutex::new(Vec::new()),
            output_target: Mutex::new(None),
            transaction_id,
            cleanup_claimed: AtomicBool::new(false),
            final_info: RwLock::new(None),
            final_listeners: Mutex::new(Vec::new()),
            executor,
            transaction_manager: services.transaction_manager,
            resource_group_manager: services.resource_group_manager,
            cleanup_handler: services.cleanup_handler,
            recovery_manager: services.recovery_manager,
            warning_collector: services.warning_collector,
            query_id,
            session,
        })
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    pub fn self_uri(&self) -> &str {
        &self.self_uri
    }

    pub fn resource_group(&self) -> &ResourceGroupId {
        &self.resource_group
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    pub fn state(&self) -> QueryState {
        self.state.get()
    }

    /// Registers a state observer; fired once with the current state at
    /// registration, then on every transition, asynchronously.
    pub fn add_state_change_listener(&self, listener: impl Fn(QueryState) + Send + Sync + 'static) {
        self.state.add_listener(listener);
    }

    /// Blocks until the state differs from `current` or the timeout
    /// elapses; returns the state observed at wakeup.
    pub fn wait_for_state_change(&self, current: QueryState, timeout: Duration) -> QueryState {
        self.state.wait_for_change(current, timeout)
    }

    pub fn to_waiting_for_resources(&self) -> bool {
        self.timer.begin_waiting_for_resources();
        self.state.set_if(QueryState::WaitingForResources, |state| {
            state < QueryState::WaitingForResources
        })
    }

    pub fn to_dispatching(&self) -> bool {
        self.timer.begin_dispatching();
        self.state
            .set_if(QueryState::Dispatching, |state| state < QueryState::Dispatching)
    }

    pub fn to_planning(&self) -> bool {
        self.timer.begin_planning();
        self.state
            .set_if(QueryState::Planning, |state| state < QueryState::Planning)
    }

    /// Enters STARTING, either for the first time or when resuming from
    /// RECOVERING; a resume clears stale output locations first.
    ///
    /// The reset is conjoined with the transition: it runs only when the
    /// RECOVERING -> STARTING transition actually commits, so a racing
    /// terminal transition cannot be preceded by a spurious wipe of the
    /// publisher's locations.
    pub fn to_starting(&self) -> bool {
        self.timer.begin_starting();
        self.state.set_if_with(
            QueryState::Starting,
            |state| state < QueryState::Starting || state == QueryState::Recovering,
            |state| {
                if state == QueryState::Recovering {
                    self.output.reset_for_resume();
                }
            },
        )
    }

    pub fn to_running(&self) -> bool {
        self.timer.begin_running();
        self.state
            .set_if(QueryState::Running, |state| state < QueryState::Running)
    }

    pub fn to_suspended(&self) -> bool {
        self.state
            .set_if(QueryState::Suspended, |state| state == QueryState::Running)
    }

    pub fn to_resume_running(&self) -> bool {
        self.state
            .set_if(QueryState::Running, |state| state == QueryState::Suspended)
    }

    pub fn to_recovering(&self) -> bool {
        self.state.set_if(QueryState::Recovering, |state| {
            matches!(state, QueryState::Running | QueryState::Suspended)
        })
    }

    /// Enters FINISHING, runs cleanup, and resolves the query's
    /// transaction.
    ///
    /// An auto-commit transaction is committed asynchronously: this method
    /// returns once the commit is enqueued, and the terminal transition
    /// (FINISHED, or FAILED carrying the commit error) happens on the
    /// executor. FINISHED is set conditionally so a concurrent FAILED
    /// preempts it.
    pub fn to_finishing(self: &Arc<Self>) -> bool {
        self.timer.begin_finishing();
        if !self.state.set_if(QueryState::Finishing, |state| {
            state != QueryState::Finishing && !state.is_terminal()
        }) {
            return false;
        }
        self.running_async.store(false, Ordering::SeqCst);

        if let Err(error) = self.cleanup() {
            self.to_failed(ExecutionFailure::internal(error.to_string()));
            return true;
        }

        let transaction_id = self.transaction_id;
        if self.transaction_manager.exists(transaction_id)
            && self.transaction_manager.is_auto_commit(transaction_id)
        {
            let controller = Arc::clone(self);
            self.executor.execute(Box::new(move || {
                match controller.transaction_manager.commit(transaction_id) {
                    Ok(()) => controller.transition_to_finished(),
                    Err(error) => {
                        controller.to_failed(ExecutionFailure::new(
                            ErrorCode::transaction_failed(),
                            error.to_string(),
                        ));
                    }
                }
            }));
        } else {
            self.transition_to_finished();
        }
        true
    }

    /// Drives the query to FAILED with the given cause.
    ///
    /// The cause is recorded (first write wins) before the transition is
    /// published, so a listener waking on FAILED always observes it.
    pub fn to_failed(self: &Arc<Self>, cause: ExecutionFailure) -> bool {
        self.cleanup_quietly();
        self.timer.end_query();
        let _ = self.failure_cause.set(cause);

        let changed = self.state.set_if(QueryState::Failed, |_| true);
        if changed {
            self.resolve_transaction_on_failure();
        }
        changed
    }

    /// Cancels the query: a failure with a synthetic user-canceled cause.
    pub fn to_canceled(self: &Arc<Self>) -> bool {
        self.to_failed(ExecutionFailure::user_canceled())
    }

    fn transition_to_finished(&self) {
        self.timer.end_query();
        self.state
            .set_if(QueryState::Finished, |state| !state.is_terminal());
    }

    fn resolve_transaction_on_failure(self: &Arc<Self>) {
        let transaction_id = self.transaction_id;
        if !self.transaction_manager.exists(transaction_id) {
            return;
        }
        if self.transaction_manager.is_auto_commit(transaction_id) {
            let controller = Arc::clone(self);
            self.executor.execute(Box::new(move || {
                if let Err(error) = controller.transaction_manager.abort(transaction_id) {
                    warn!(
                        query_id = %controller.query_id,
                        error = %error,
                        "abort of auto-commit transaction failed; marking it failed"
                    );
                    controller.transaction_manager.fail(transaction_id);
                }
            }));
        } else {
            self.transaction_manager.fail(transaction_id);
        }
    }

    /// The recorded failure cause, if the query has one.
    pub fn failure_cause(&self) -> Option<&ExecutionFailure> {
        self.failure_cause.get()
    }

    // ========================================================================
    // Timing
    // ========================================================================

    pub fn begin_analysis(&self) {
        self.timer.begin_analysis();
    }

    pub fn end_analysis(&self) {
        self.timer.end_analysis();
    }

    pub fn record_heartbeat(&self) {
        self.timer.record_heartbeat();
    }

    // ========================================================================
    // Memory
    // ========================================================================

    /// Applies memory deltas and raises the peak watermarks. See
    /// [`MemoryWatermarks::update`] for the (lack of) cross-field ordering.
    pub fn update_memory(
        &self,
        delta_user: i64,
        delta_revocable: i64,
        delta_total: i64,
        task_user: i64,
        task_revocable: i64,
        task_total: i64,
    ) {
        self.memory.update(
            delta_user,
            delta_revocable,
            delta_total,
            task_user,
            task_revocable,
            task_total,
        );
    }

    pub fn memory(&self) -> &MemoryWatermarks {
        &self.memory
    }

    /// True when the query's resource group is registered and carries a
    /// bounded soft memory reservation.
    pub fn memory_throttling_enabled(&self) -> bool {
        self.resource_group_manager.is_registered(&self.resource_group)
            && self
                .resource_group_manager
                .soft_reserved_memory(&self.resource_group)
                .is_some()
    }

    /// Reassigns the query's memory pool.
    ///
    /// Updates from the memory manager can arrive out of order; an update
    /// whose version does not exceed the current assignment's is stale and
    /// is rejected. Returns true iff the reassignment applied.
    pub fn set_memory_pool(&self, pool: VersionedMemoryPoolId) -> bool {
        let mut current = write(&self.memory_pool);
        if pool.version <= current.version {
            warn!(
                query_id = %self.query_id,
                stale = pool.version,
                current = current.version,
                "ignoring stale memory pool reassignment"
            );
            return false;
        }
        *current = pool;
        true
    }

    pub fn memory_pool(&self) -> VersionedMemoryPoolId {
        read(&self.memory_pool).clone()
    }

    pub fn set_running_async(&self, running_async: bool) {
        self.running_async.store(running_async, Ordering::SeqCst);
    }

    pub fn is_running_async(&self) -> bool {
        self.running_async.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Session Mutations
    // ========================================================================

    pub fn set_catalog(&self, catalog: impl Into<String>) {
        *lock(&self.set_catalog) = Some(catalog.into());
    }

    pub fn set_schema(&self, schema: impl Into<String>) {
        *lock(&self.set_schema) = Some(schema.into());
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *lock(&self.set_path) = Some(path.into());
    }

    pub fn add_set_session_property(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.set_session_properties).insert(name.into(), value.into());
    }

    pub fn add_reset_session_property(&self, name: impl Into<String>) {
        lock(&self.reset_session_properties).insert(name.into());
    }

    pub fn add_set_role(&self, catalog: impl Into<String>, role: impl Into<String>) {
        lock(&self.set_roles).insert(catalog.into(), role.into());
    }

    pub fn add_prepared_statement(&self, name: impl Into<String>, sql: impl Into<String>) {
        lock(&self.added_prepared_statements).insert(name.into(), sql.into());
    }

    /// Marks a prepared statement for deallocation.
    pub fn remove_prepared_statement(&self, name: &str) -> CoordinatorResult<()> {
        if self.session.prepared_statement(name).is_none() {
            return Err(CoordinatorError::PreparedStatementNotFound(name.to_string()));
        }
        lock(&self.deallocated_prepared_statements).insert(name.to_string());
        Ok(())
    }

    /// Records that this query started a client transaction. First write
    /// wins; later writes are ignored.
    ///
    /// # Panics
    ///
    /// Panics if the query already requested clearing the transaction;
    /// the two are mutually exclusive.
    pub fn set_started_transaction_id(&self, transaction_id: TransactionId) {
        assert!(
            !self.clear_transaction.load(Ordering::SeqCst),
            "cannot start a transaction in a query that cleared one"
        );
        let mut started = lock(&self.started_transaction_id);
        if started.is_none() {
            *started = Some(transaction_id);
        }
    }

    /// Records that this query ended the client transaction.
    ///
    /// # Panics
    ///
    /// Panics if the query already started a transaction.
    pub fn set_clear_transaction_id(&self) {
        assert!(
            lock(&self.started_transaction_id).is_none(),
            "cannot clear the transaction in a query that started one"
        );
        self.clear_transaction.store(true, Ordering::SeqCst);
    }

    pub fn set_update_type(&self, update_type: impl Into<String>) {
        *lock(&self.update_type) = Some(update_type.into());
    }

    pub fn set_inputs(&self, inputs: Vec<QueryInput>) {
        *lock(&self.inputs) = inputs;
    }

    pub fn set_output(&self, output: Option<QueryOutput>) {
        *lock(&self.output_target) = output;
    }

    // ========================================================================
    // Output Publication
    // ========================================================================

    pub fn set_columns(&self, names: Vec<String>, types: Vec<String>) {
        self.output.set_columns(names, types);
    }

    pub fn update_output_locations<I>(&self, locations: I, no_more: bool)
    where
        I: IntoIterator<Item = (gabbro_types::TaskId, String)>,
    {
        self.output.update_output_locations(locations, no_more);
    }

    pub fn record_output_task_failure(
        &self,
        task_id: gabbro_types::TaskId,
        failure: ExecutionFailure,
    ) {
        self.output.record_task_failure(task_id, failure);
    }

    pub fn add_output_info_listener(
        &self,
        listener: impl Fn(QueryOutputInfo) + Send + Sync + 'static,
    ) {
        self.output.add_output_info_listener(listener);
    }

    pub fn add_output_task_failure_listener(
        &self,
        listener: impl Fn(gabbro_types::TaskId, ExecutionFailure) + Send + Sync + 'static,
    ) {
        self.output.add_task_failure_listener(listener);
    }

    pub fn output_info(&self) -> Option<QueryOutputInfo> {
        self.output.output_info()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Runs external cleanup exactly once across all callers. Later calls
    /// (including retries after a cleanup failure) are no-ops.
    fn cleanup(&self) -> Result<(), CleanupError> {
        if self
            .cleanup_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.cleanup_handler.cleanup_query(&self.session)?;
        self.cleanup_handler.cleanup_context(&self.query_id)?;
        Ok(())
    }

    fn cleanup_quietly(&self) {
        if let Err(error) = self.cleanup() {
            warn!(query_id = %self.query_id, error = %error, "query cleanup failed");
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Assembles the lightweight snapshot from controller state and the
    /// supplied stage roll-up.
    pub fn basic_info(&self, stage_stats: Option<BasicStageStats>) -> BasicQueryInfo {
        // Sample the state before any telemetry: reading it afterwards
        // could pair task-level counters with a state that has since
        // advanced past them.
        let state = self.state.get();

        let mut stats = BasicQueryStats {
            create_time: Some(self.timer.create_time()),
            end_time: self.timer.end_time(),
            queued_time: self.timer.queued_time(),
            elapsed_time: self.timer.elapsed_time(),
            execution_time: self.timer.execution_time(),
            user_memory_bytes: self.memory.current_user(),
            total_memory_bytes: self.memory.current_total(),
            peak_user_memory_bytes: self.memory.peak_user(),
            peak_total_memory_bytes: self.memory.peak_total(),
            ..BasicQueryStats::default()
        };
        if let Some(stages) = stage_stats {
            stats.total_drivers = stages.total_drivers;
            stats.queued_drivers = stages.queued_drivers;
            stats.running_drivers = stages.running_drivers;
            stats.completed_drivers = stages.completed_drivers;
            stats.raw_input_bytes = stages.raw_input_bytes;
            stats.raw_input_rows = stages.raw_input_rows;
            stats.total_cpu_time = stages.total_cpu_time;
            stats.total_scheduled_time = stages.total_scheduled_time;
            stats.fully_blocked = stages.fully_blocked;
            stats.blocked_reasons = stages.blocked_reasons;
        }

        BasicQueryInfo {
            query_id: self.query_id.clone(),
            session: self.session.clone(),
            resource_group_id: self.resource_group.clone(),
            state,
            memory_pool: self.memory_pool(),
            self_uri: self.self_uri.clone(),
            query_text: self.query_text.clone(),
            prepared_query: self.prepared_query.clone(),
            update_type: lock(&self.update_type).clone(),
            stats,
            failure: self.failure_cause.get().cloned(),
        }
    }

    /// Assembles the complete snapshot, rolling up the supplied stage
    /// tree.
    ///
    /// If the result is final (terminal state, all stages done), it is
    /// written into the one-shot final cell and final-info listeners fire.
    pub fn full_info(self: &Arc<Self>, output_stage: Option<StageInfo>) -> Arc<QueryInfo> {
        // Sampled first, same reasoning as in `basic_info`.
        let state = self.state.get();

        let mut stats = self.lifecycle_stats();
        if let Some(root) = &output_stage {
            stats.roll_up_stages(root);
        }

        let scheduled = output_stage.as_ref().is_some_and(|root| {
            root.all_stages()
                .iter()
                .all(|stage| stage.state.is_running_or_done())
        });
        let all_stages_done = output_stage.as_ref().is_some_and(StageInfo::is_complete);
        let final_info =
            state.is_terminal() && output_stage.as_ref().is_none_or(StageInfo::is_complete);

        let info = Arc::new(QueryInfo {
            query_id: self.query_id.clone(),
            session: self.session.clone(),
            state,
            memory_pool: self.memory_pool(),
            scheduled,
            self_uri: self.self_uri.clone(),
            query_text: self.query_text.clone(),
            prepared_query: self.prepared_query.clone(),
            update_type: lock(&self.update_type).clone(),
            stats,
            set_catalog: lock(&self.set_catalog).clone(),
            set_schema: lock(&self.set_schema).clone(),
            set_path: lock(&self.set_path).clone(),
            set_session_properties: lock(&self.set_session_properties).clone(),
            reset_session_properties: lock(&self.reset_session_properties).clone(),
            set_roles: lock(&self.set_roles).clone(),
            added_prepared_statements: lock(&self.added_prepared_statements).clone(),
            deallocated_prepared_statements: lock(&self.deallocated_prepared_statements).clone(),
            started_transaction_id: *lock(&self.started_transaction_id),
            clear_transaction_id: self.clear_transaction.load(Ordering::SeqCst),
            output_stage,
            failure: self.failure_cause.get().cloned(),
            warnings: self.warning_collector.warnings(),
            inputs: lock(&self.inputs).clone(),
            output: lock(&self.output_target).clone(),
            resource_group_id: self.resource_group.clone(),
            final_info,
        });

        if info.final_info {
            self.try_set_final_info(&info);
        }
        self.maybe_enter_recovery(all_stages_done);
        info
    }

    fn lifecycle_stats(&self) -> QueryStats {
        QueryStats {
            create_time: Some(self.timer.create_time()),
            execution_start_time: self.timer.execution_start_time(),
            end_time: self.timer.end_time(),
            last_heartbeat: Some(self.timer.last_heartbeat()),
            elapsed_time: self.timer.elapsed_time(),
            queued_time: self.timer.queued_time(),
            resource_waiting_time: self.timer.resource_waiting_time(),
            dispatching_time: self.timer.dispatching_time(),
            planning_time: self.timer.planning_time(),
            analysis_time: self.timer.analysis_time(),
            execution_time: self.timer.execution_time(),
            finishing_time: self.timer.finishing_time(),
            user_memory_bytes: self.memory.current_user(),
            revocable_memory_bytes: self.memory.current_revocable(),
            total_memory_bytes: self.memory.current_total(),
            peak_user_memory_bytes: self.memory.peak_user(),
            peak_revocable_memory_bytes: self.memory.peak_revocable(),
            peak_total_memory_bytes: self.memory.peak_total(),
            peak_task_user_memory_bytes: self.memory.peak_task_user(),
            peak_task_revocable_memory_bytes: self.memory.peak_task_revocable(),
            peak_task_total_memory_bytes: self.memory.peak_task_total(),
            ..QueryStats::default()
        }
    }

    /// Recovery is read during snapshot assembly, so this mutation rides
    /// on the read path. That couples the two and can race external
    /// callers: a transition committed between the collaborator read and
    /// `to_recovering` makes this check lose quietly, which is the
    /// intended outcome.
    fn maybe_enter_recovery(self: &Arc<Self>, all_stages_done: bool) {
        if self.recovery_enabled
            && all_stages_done
            && self.recovery_manager.state() == RecoveryState::StoppingForReschedule
            && self.to_recovering()
        {
            if let Err(error) = self.recovery_manager.reschedule_query() {
                self.to_failed(ExecutionFailure::internal(error.to_string()));
            }
        }
    }

    /// Registers a listener fired exactly once with the final snapshot,
    /// immediately if it is already present.
    pub fn add_final_info_listener(
        &self,
        listener: impl Fn(Arc<QueryInfo>) + Send + Sync + 'static,
    ) {
        let subscription = Arc::new(FinalInfoSubscription {
            fired: AtomicBool::new(false),
            listener: Box::new(listener),
        });
        lock(&self.final_listeners).push(Arc::clone(&subscription));
        if let Some(info) = self.final_info() {
            self.fire_final(&subscription, info);
        }
    }

    /// The final snapshot, if the query has produced one.
    pub fn final_info(&self) -> Option<Arc<QueryInfo>> {
        read(&self.final_info).clone()
    }

    /// Replaces the final snapshot with its pruned variant to reclaim
    /// memory. Scalar telemetry is untouched; no-op until a final
    /// snapshot exists.
    pub fn prune_final_info(&self) {
        let mut cell = write(&self.final_info);
        if let Some(current) = cell.as_ref() {
            *cell = Some(Arc::new(current.pruned()));
        }
    }

    fn try_set_final_info(&self, info: &Arc<QueryInfo>) {
        {
            let mut cell = write(&self.final_info);
            if cell.is_some() {
                return;
            }
            *cell = Some(Arc::clone(info));
        }
        let subscriptions = lock(&self.final_listeners).clone();
        for subscription in subscriptions {
            self.fire_final(&subscription, Arc::clone(info));
        }
    }

    fn fire_final(&self, subscription: &Arc<FinalInfoSubscription>, info: Arc<QueryInfo>) {
        if subscription
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let subscription = Arc::clone(subscription);
            self.executor
                .execute(Box::new(move || (subscription.listener)(info)));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
