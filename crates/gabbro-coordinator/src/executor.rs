//! Notification executor for listener fan-out.
//!
//! State transitions and output publications never invoke listeners on the
//! caller's thread; callbacks are enqueued here and delivered by worker
//! threads. Delivery order across concurrent transitions is deliberately
//! unspecified, so listeners must re-read authoritative state when ordering
//! matters.
//!
//! # Design
//!
//! - A single shared bounded inbox (`crossbeam-queue::ArrayQueue`) feeds a
//!   small pool of worker threads. Notifications carry no per-key ordering
//!   requirement, so one queue suffices.
//! - No async runtime -- plain synchronous threads with yield-wait on the
//!   inbox.
//! - Listener panics are caught and logged on the worker thread; they never
//!   reach the component that triggered the notification.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;
use tracing::error;

/// A unit of deferred work: a listener invocation bound to its argument.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes listener callbacks on behalf of lifecycle components.
///
/// Implementations must accept tasks from any thread and must not run them
/// while the submitter holds component monitors (submitters guarantee the
/// latter by enqueuing outside their locks).
pub trait Executor: Send + Sync {
    /// Enqueues a task for eventual execution.
    fn execute(&self, task: Task);
}

/// Runs tasks inline on the submitting thread.
///
/// Useful in tests where deterministic, immediate delivery is wanted.
/// Panics are still contained so a misbehaving listener cannot unwind into
/// a mutator.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerExecutor;

impl Executor for CallerExecutor {
    fn execute(&self, task: Task) {
        run_contained(task);
    }
}

enum WorkerMessage {
    Run(Task),
    Shutdown,
}

/// Configuration for [`ThreadPoolExecutor`].
pub struct ExecutorConfig {
    /// Number of worker threads to spawn.
    pub worker_count: usize,
    /// Capacity of the shared task inbox.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 1024,
        }
    }
}

/// A fixed pool of worker threads draining a shared bounded inbox.
///
/// # Lifecycle
///
/// 1. Create with `ThreadPoolExecutor::new(config)` -- workers start
///    immediately.
/// 2. Submit tasks via [`Executor::execute`].
/// 3. Call `shutdown()` (or drop) to stop workers after the inbox drains.
pub struct ThreadPoolExecutor {
    inbox: Arc<ArrayQueue<WorkerMessage>>,
    handles: Vec<Option<thread::JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    /// Creates a pool and spawns its worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` or `queue_capacity` is 0.
    pub fn new(config: ExecutorConfig) -> Self {
        assert!(config.worker_count > 0, "worker_count must be positive");
        assert!(config.queue_capacity > 0, "queue_capacity must be positive");

        let inbox = Arc::new(ArrayQueue::new(config.queue_capacity));
        let mut handles = Vec::with_capacity(config.worker_count);

        for worker_id in 0..config.worker_count {
            let inbox = Arc::clone(&inbox);
            let handle = thread::Builder::new()
                .name(format!("gbr-notify-{worker_id}"))
                .spawn(move || Self::worker_loop(&inbox))
                .expect("failed to spawn notification worker");
            handles.push(Some(handle));
        }

        Self { inbox, handles }
    }

    fn worker_loop(inbox: &ArrayQueue<WorkerMessage>) {
        loop {
            match inbox.pop() {
                Some(WorkerMessage::Run(task)) => run_contained(task),
                Some(WorkerMessage::Shutdown) => break,
                None => thread::yield_now(),
            }
        }
    }

    /// Stops all workers after the inbox drains and joins their threads.
    ///
    /// Safe to call multiple times; subsequent calls are no-ops.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }

        for _ in 0..self.handles.len() {
            let mut message = WorkerMessage::Shutdown;
            // Workers drain the inbox in FIFO order, so pending tasks run
            // before the shutdown marker is seen.
            while let Err(returned) = self.inbox.push(message) {
                message = returned;
                thread::yield_now();
            }
        }

        for handle in &mut self.handles {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
        self.handles.clear();
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        let mut message = WorkerMessage::Run(task);
        // Notifications must not be dropped; spin until a slot frees up.
        while let Err(returned) = self.inbox.push(message) {
            message = returned;
            thread::yield_now();
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs a task, containing any panic it raises.
fn run_contained(task: Task) {
    if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = panic_message(&cause);
        error!(panic = %message, "listener panicked; notification dropped");
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
