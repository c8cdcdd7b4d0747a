//! Publication of query output metadata to late-binding subscribers.
//!
//! The publisher owns the evolving output schema (columns, set at most
//! once) and the set of downstream exchange locations reported by the
//! output stage. Consumers subscribe at any point in the query lifecycle:
//! a subscriber arriving after the information exists receives exactly one
//! catch-up notification, then sees future updates as they happen.
//!
//! All state lives behind a single monitor. Listeners are copied under the
//! monitor and invoked via the notification executor outside it; the
//! monitor is never held across an executor call.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use gabbro_types::{ExecutionFailure, TaskId};

use crate::executor::Executor;

/// A snapshot of everything a consumer needs to read query output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutputInfo {
    pub column_names: Vec<String>,
    /// Type signatures, parallel to `column_names`.
    pub column_types: Vec<String>,
    /// Exchange locations in the order they were reported.
    pub exchange_locations: Vec<(TaskId, String)>,
    /// True once the location set is complete.
    pub no_more_locations: bool,
}

/// Observer of [`QueryOutputInfo`] updates.
pub type OutputInfoListener = Arc<dyn Fn(QueryOutputInfo) + Send + Sync>;

/// Observer of per-task failures in the output stage.
pub type TaskFailureListener = Arc<dyn Fn(TaskId, ExecutionFailure) + Send + Sync>;

struct Inner {
    column_names: Option<Vec<String>>,
    column_types: Option<Vec<String>>,
    exchange_locations: Vec<(TaskId, String)>,
    known_locations: HashSet<TaskId>,
    no_more_locations: bool,
    info_listeners: Vec<OutputInfoListener>,
    task_failures: Vec<(TaskId, ExecutionFailure)>,
    failed_tasks: HashSet<TaskId>,
    failure_listeners: Vec<TaskFailureListener>,
}

/// Fans out output schema, exchange locations, and output-stage task
/// failures to subscribers.
pub struct OutputPublisher {
    inner: Mutex<Inner>,
    executor: Arc<dyn Executor>,
}

impl OutputPublisher {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                column_names: None,
                column_types: None,
                exchange_locations: Vec::new(),
                known_locations: HashSet::new(),
                no_more_locations: false,
                info_listeners: Vec::new(),
                task_failures: Vec::new(),
                failed_tasks: HashSet::new(),
                failure_listeners: Vec::new(),
            }),
            executor,
        }
    }

    /// Registers an output-info subscriber.
    ///
    /// If the output info is already publishable (columns known), the
    /// subscriber is asynchronously invoked once with the current info
    /// before this call returns; otherwise it first fires on the next
    /// publish.
    pub fn add_output_info_listener(&self, listener: impl Fn(QueryOutputInfo) + Send + Sync + 'static) {
        let listener: OutputInfoListener = Arc::new(listener);
        let catch_up = {
            let mut inner = self.lock();
            inner.info_listeners.push(Arc::clone(&listener));
            Self::current_info(&inner)
        };
        if let Some(info) = catch_up {
            self.executor.execute(Box::new(move || listener(info)));
        }
    }

    /// Registers a task-failure subscriber and replays already-recorded
    /// failures to it asynchronously.
    pub fn add_task_failure_listener(
        &self,
        listener: impl Fn(TaskId, ExecutionFailure) + Send + Sync + 'static,
    ) {
        let listener: TaskFailureListener = Arc::new(listener);
        let replay = {
            let mut inner = self.lock();
            inner.failure_listeners.push(Arc::clone(&listener));
            inner.task_failures.clone()
        };
        for (task_id, failure) in replay {
            let listener = Arc::clone(&listener);
            self.executor
                .execute(Box::new(move || listener(task_id, failure)));
        }
    }

    /// Sets the output schema. May be called at most once.
    ///
    /// # Panics
    ///
    /// Panics if the columns were already set or the arities disagree;
    /// both are contract violations by the planner.
    pub fn set_columns(&self, names: Vec<String>, types: Vec<String>) {
        let publication = {
            let mut inner = self.lock();
            assert!(
                inner.column_names.is_none(),
                "output columns already set"
            );
            assert_eq!(
                names.len(),
                types.len(),
                "column names and types must have equal arity"
            );
            inner.column_names = Some(names);
            inner.column_types = Some(types);
            Self::take_publication(&inner)
        };
        self.publish(publication);
    }

    /// Adds exchange locations reported by the output stage.
    ///
    /// The `no_more` latch is sticky: once set, later calls may only
    /// repeat already-known locations.
    ///
    /// # Panics
    ///
    /// Panics if a new location arrives after `no_more` was set.
    pub fn update_output_locations<I>(&self, locations: I, no_more: bool)
    where
        I: IntoIterator<Item = (TaskId, String)>,
    {
        let publication = {
            let mut inner = self.lock();
            for (task_id, uri) in locations {
                if inner.known_locations.contains(&task_id) {
                    continue;
                }
                assert!(
                    !inner.no_more_locations,
                    "location for task {task_id} added after no-more-locations"
                );
                inner.known_locations.insert(task_id.clone());
                inner.exchange_locations.push((task_id, uri));
            }
            inner.no_more_locations |= no_more;
            Self::take_publication(&inner)
        };
        self.publish(publication);
    }

    /// Records a failure of an output-stage task and notifies subscribers.
    /// Repeated reports for the same task are ignored.
    pub fn record_task_failure(&self, task_id: TaskId, failure: ExecutionFailure) {
        let listeners = {
            let mut inner = self.lock();
            if !inner.failed_tasks.insert(task_id.clone()) {
                return;
            }
            inner.task_failures.push((task_id.clone(), failure.clone()));
            inner.failure_listeners.clone()
        };
        for listener in listeners {
            let task_id = task_id.clone();
            let failure = failure.clone();
            self.executor
                .execute(Box::new(move || listener(task_id, failure)));
        }
    }

    /// Clears locations and the no-more latch ahead of a recovery resume.
    /// The output schema, subscribers, and recorded failures survive.
    pub fn reset_for_resume(&self) {
        let mut inner = self.lock();
        debug!(
            dropped = inner.exchange_locations.len(),
            "resetting output locations for resume"
        );
        inner.exchange_locations.clear();
        inner.known_locations.clear();
        inner.no_more_locations = false;
    }

    /// Returns the current output info if it is publishable.
    pub fn output_info(&self) -> Option<QueryOutputInfo> {
        Self::current_info(&self.lock())
    }

    fn current_info(inner: &Inner) -> Option<QueryOutputInfo> {
        let names = inner.column_names.as_ref()?;
        let types = inner.column_types.as_ref()?;
        Some(QueryOutputInfo {
            column_names: names.clone(),
            column_types: types.clone(),
            exchange_locations: inner.exchange_locations.clone(),
            no_more_locations: inner.no_more_locations,
        })
    }

    /// Snapshot of (info, listeners) taken under the monitor, if the info
    /// is publishable.
    fn take_publication(inner: &Inner) -> Option<(QueryOutputInfo, Vec<OutputInfoListener>)> {
        Self::current_info(inner).map(|info| (info, inner.info_listeners.clone()))
    }

    fn publish(&self, publication: Option<(QueryOutputInfo, Vec<OutputInfoListener>)>) {
        let Some((info, listeners)) = publication else {
            return;
        };
        for listener in listeners {
            let info = info.clone();
            self.executor.execute(Box::new(move || listener(info)));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
