//! Thread-safe state cell with terminal absorption and listener fan-out.
//!
//! A [`StateRegister`] holds one value of an enumerated state type. Values
//! flagged terminal by [`StateValue::is_terminal`] absorb all further
//! writes: once the register is terminal, `set_if` returns false without
//! consulting the caller's predicate.
//!
//! Every successful transition enqueues one notification per registered
//! listener on the notification executor. Listeners run asynchronously and
//! may observe notifications out of order across concurrent transitions;
//! they must treat the carried value as a hint and re-read the register if
//! ordering matters.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::executor::Executor;

/// A state type storable in a [`StateRegister`].
pub trait StateValue: Copy + PartialEq + Debug + Send + 'static {
    /// Terminal values absorb all subsequent writes.
    fn is_terminal(&self) -> bool;
}

/// Observer of state transitions. Invoked with the value that was set.
pub type StateListener<S> = Arc<dyn Fn(S) + Send + Sync>;

struct Inner<S> {
    value: S,
    listeners: Vec<StateListener<S>>,
}

/// A thread-safe cell over an enumerated state with conditional
/// transitions, absorbing terminal values, and asynchronous listeners.
pub struct StateRegister<S: StateValue> {
    /// Diagnostic label included in transition logs.
    name: String,
    inner: Mutex<Inner<S>>,
    changed: Condvar,
    executor: Arc<dyn Executor>,
}

impl<S: StateValue> StateRegister<S> {
    pub fn new(name: impl Into<String>, initial: S, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                value: initial,
                listeners: Vec::new(),
            }),
            changed: Condvar::new(),
            executor,
        }
    }

    /// Returns the current value.
    pub fn get(&self) -> S {
        self.lock().value
    }

    /// Atomically transitions to `target` if the current value is
    /// non-terminal and `predicate` holds for it.
    ///
    /// Returns true iff the transition fired. Terminal values reject all
    /// transitions without consulting the predicate.
    pub fn set_if(&self, target: S, predicate: impl FnOnce(S) -> bool) -> bool {
        self.set_if_with(target, predicate, |_| {})
    }

    /// Like [`StateRegister::set_if`], but runs `on_transition` with the
    /// outgoing value when the transition commits.
    ///
    /// The hook runs under the monitor, after the predicate passes and
    /// before the new value is published to listeners or waiters, so a
    /// transition that does not commit never observes the hook's effects.
    /// The hook must not call back into this register.
    pub fn set_if_with(
        &self,
        target: S,
        predicate: impl FnOnce(S) -> bool,
        on_transition: impl FnOnce(S),
    ) -> bool {
        let (old, listeners) = {
            let mut inner = self.lock();
            let current = inner.value;
            if current.is_terminal() || current == target || !predicate(current) {
                return false;
            }
            on_transition(current);
            inner.value = target;
            self.changed.notify_all();
            (current, inner.listeners.clone())
        };

        debug!(register = %self.name, from = ?old, to = ?target, "state transition");
        self.fan_out(&listeners, target);
        true
    }

    /// Registers an observer.
    ///
    /// The observer is fired once with the current value at registration
    /// time (asynchronously, via the executor) and again after every
    /// subsequent successful transition.
    pub fn add_listener(&self, listener: impl Fn(S) + Send + Sync + 'static) {
        let listener: StateListener<S> = Arc::new(listener);
        let current = {
            let mut inner = self.lock();
            inner.listeners.push(Arc::clone(&listener));
            inner.value
        };
        self.fan_out(std::slice::from_ref(&listener), current);
    }

    /// Blocks until the register holds a value different from `current`
    /// or the timeout elapses, and returns the value observed at wakeup.
    ///
    /// A return value equal to `current` therefore means the wait timed
    /// out without a transition.
    pub fn wait_for_change(&self, current: S, timeout: Duration) -> S {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.value == current {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _timed_out) = self
                .changed
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
        inner.value
    }

    fn fan_out(&self, listeners: &[StateListener<S>], value: S) {
        // The monitor is never held here; listener work happens on the
        // executor's threads, which also contain listener panics.
        for listener in listeners {
            let listener = Arc::clone(listener);
            self.executor.execute(Box::new(move || listener(value)));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<S>> {
        // A poisoned monitor only means a predicate panicked mid-check;
        // the stored value is still a single consistent assignment.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
