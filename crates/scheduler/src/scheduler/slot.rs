use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::deferred::{Outcome, PromiseError};
use crate::pool::{PoolError, TimerHandle};

use super::core::SchedulerShared;
use super::task::{Task, TaskOutcome};

/// Lifecycle state of one live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// A timer is pending for the next invocation.
    Armed { timer: TimerHandle },
    /// A worker picked up the expired timer and is invoking the callback.
    Dispatching,
    /// The callback returned; its deferred outcome is pending.
    Running,
    /// Outcome received; the repeat timer is being registered.
    AwaitingRepeat,
    /// The callback asked to terminate, or completed after shutdown began.
    Retired,
    /// Shutdown cancelled the task's pending timer before it could fire.
    Cancelled,
}

/// Scheduler-side bookkeeping for one live task.
///
/// The scheduler holds the only long-lived strong reference; every closure
/// handed to the pool or chained onto a deferred outcome captures a `Weak`
/// and upgrades at entry, so a retired slot is freed as soon as its last
/// in-flight continuation finishes.
pub(crate) struct TaskSlot {
    pub(crate) id: u64,
    pub(crate) task: Task,
    state: Mutex<SlotState>,
    shared: Weak<SchedulerShared>,
}

impl TaskSlot {
    pub(crate) fn new(id: u64, task: Task, shared: &Arc<SchedulerShared>) -> Arc<TaskSlot> {
        Arc::new(TaskSlot {
            id,
            task,
            state: Mutex::new(SlotState::AwaitingRepeat),
            shared: Arc::downgrade(shared),
        })
    }

    fn expiry(self: &Arc<Self>) -> impl FnOnce() + Send + 'static {
        let slot = Arc::downgrade(self);
        move || {
            if let Some(slot) = slot.upgrade() {
                slot.dispatch();
            }
        }
    }

    /// Arm the first invocation. The state lock is held across timer
    /// registration so an instantly-expiring timer cannot observe the slot
    /// before its handle is recorded.
    pub(crate) fn arm(self: &Arc<Self>, delay: Duration) -> Result<(), PoolError> {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Ok(()),
        };
        let mut state = self.state.lock().unwrap();
        let timer = shared.pool.post_after(delay, self.expiry())?;
        *state = SlotState::Armed { timer };
        Ok(())
    }

    /// Timer expiration: invoke the callback and chain the completion.
    fn dispatch(self: &Arc<Self>) {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                SlotState::Armed { .. } => *state = SlotState::Dispatching,
                // Only an armed slot has a dispatch in flight.
                _ => return,
            }
        }
        shared.executing.fetch_add(1, Ordering::SeqCst);

        debug!("task '{}' callback entered", self.task.name);
        let started = Instant::now();
        let callback = Arc::clone(&self.task.callback);
        match catch_unwind(AssertUnwindSafe(move || callback())) {
            Ok(deferred) => {
                *self.state.lock().unwrap() = SlotState::Running;
                let slot = Arc::downgrade(self);
                deferred.then(move |outcome| {
                    if let Some(slot) = slot.upgrade() {
                        slot.complete(started, outcome);
                    }
                });
            }
            Err(payload) => {
                warn!(
                    "task '{}' callback panicked: {}",
                    self.task.name,
                    panic_message(payload.as_ref())
                );
                *self.state.lock().unwrap() = SlotState::Running;
                self.complete(started, Err(PromiseError::Failed("callback panicked".to_string())));
            }
        }
    }

    /// Callback completion: update counters and metrics, then re-arm or go
    /// terminal.
    fn complete(self: &Arc<Self>, started: Instant, result: Outcome<TaskOutcome>) {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        shared.executing.fetch_sub(1, Ordering::SeqCst);
        shared.notify_progress();

        let elapsed = started.elapsed();
        if let Ok(mut metrics) = shared.metrics.write() {
            metrics.record_execution(&self.task.name, elapsed);
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("task '{}' callback failed: {}", self.task.name, err);
                TaskOutcome::Terminate
            }
        };
        debug!(
            "task '{}' callback completed in {:?} ({:?})",
            self.task.name, elapsed, outcome
        );

        let terminal = match outcome {
            TaskOutcome::Continue => self.rearm(&shared),
            TaskOutcome::Terminate => {
                *self.state.lock().unwrap() = SlotState::Retired;
                Some(SlotState::Retired)
            }
        };
        if let Some(terminal) = terminal {
            shared.remove_slot(self.id, &self.task.name, terminal);
        }
    }

    /// Register the repeat timer, measured from this moment (the callback's
    /// completion). Returns the terminal state instead if shutdown began or
    /// the pool refused the work.
    ///
    /// The accepting check and the arming happen under the state lock: a
    /// slot that re-arms before the shutdown sweep reaches it is cancelled
    /// by the sweep, and one that decides afterwards observes the cleared
    /// flag here.
    fn rearm(self: &Arc<Self>, shared: &Arc<SchedulerShared>) -> Option<SlotState> {
        let mut state = self.state.lock().unwrap();
        if !shared.accepting.load(Ordering::SeqCst) {
            *state = SlotState::Retired;
            return Some(SlotState::Retired);
        }
        *state = SlotState::AwaitingRepeat;
        match shared.pool.post_after(self.task.repeat_delay, self.expiry()) {
            Ok(timer) => {
                *state = SlotState::Armed { timer };
                None
            }
            Err(err) => {
                error!("task '{}' could not re-arm: {}", self.task.name, err);
                *state = SlotState::Retired;
                Some(SlotState::Retired)
            }
        }
    }

    /// Shutdown sweep: cancel a pending timer. Returns whether the slot went
    /// terminal here. A timer whose work was already handed to a worker lost
    /// the race; the slot stays armed so the callback runs to completion,
    /// and [`complete`](TaskSlot::complete) observes the accepting flag.
    pub(crate) fn cancel(&self, shared: &SchedulerShared) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SlotState::Armed { timer } => {
                if shared.pool.cancel(timer) {
                    *state = SlotState::Cancelled;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
