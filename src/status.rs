//! Shared observable state between a consumer handle and its worker.

use crate::types::State;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

/// The one cross-task mutable surface per worker.
///
/// `current` and `last_poll` are written by the worker; `desired` is written
/// by the handle, the doctor, or the worker's own disable path. Readers may
/// observe values at most one loop cycle stale.
#[derive(Debug)]
pub struct ConsumerStatus {
    trigger: String,
    inner: Mutex<StatusInner>,
}

#[derive(Debug)]
struct StatusInner {
    current: State,
    desired: State,
    /// `None` until the first polling window completes.
    last_poll: Option<Instant>,
}

impl ConsumerStatus {
    pub fn new(trigger: impl Into<String>, current: State, desired: State) -> Self {
        ConsumerStatus {
            trigger: trigger.into(),
            inner: Mutex::new(StatusInner {
                current,
                desired,
                last_poll: None,
            }),
        }
    }

    pub fn current(&self) -> State {
        self.inner.lock().current
    }

    /// Record where the worker actually is. This never drives a transition.
    pub fn record_current(&self, state: State) {
        self.inner.lock().current = state;
    }

    pub fn desired(&self) -> State {
        self.inner.lock().desired
    }

    /// Ask the worker to move toward `state`.
    ///
    /// A desired state of `Dead` is sticky: once requested it cannot be
    /// overwritten by anything else.
    pub fn set_desired(&self, state: State) {
        let mut inner = self.inner.lock();
        if inner.desired == State::Dead && state != State::Dead {
            info!(
                trigger = %self.trigger,
                "asked to move a consumer that is already marked for death to {state}, doing nothing"
            );
            return;
        }
        info!(trigger = %self.trigger, "setting desired state to {state}");
        inner.desired = state;
    }

    /// Convenience check the worker's loops key off.
    pub fn should_run(&self) -> bool {
        self.desired() == State::Running
    }

    pub fn has_polled(&self) -> bool {
        self.inner.lock().last_poll.is_some()
    }

    /// Stamp the end of a polling window.
    pub fn mark_polled(&self) {
        self.inner.lock().last_poll = Some(Instant::now());
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.inner.lock().last_poll
    }

    /// Seconds since the last completed polling window; `None` until the
    /// first window completes (the "never polled" sentinel).
    pub fn seconds_since_last_poll(&self) -> Option<f64> {
        self.last_poll().map(|at| at.elapsed().as_secs_f64())
    }
}
