use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::{debug, info};

use crate::pool::WorkerPool;

use super::metrics::SchedulerMetrics;
use super::slot::{SlotState, TaskSlot};
use super::task::{SchedulerError, Task};

/// Scheduler internals shared with the task slots.
///
/// Slots and their continuations hold weak references back to this, so a
/// dropped scheduler never keeps itself alive through in-flight work.
pub(crate) struct SchedulerShared {
    pub(crate) pool: Arc<WorkerPool>,
    /// Live task slots, keyed by submission id.
    slots: Mutex<HashMap<u64, Arc<TaskSlot>>>,
    next_slot_id: AtomicU64,
    /// Slots that are not yet retired or cancelled.
    pub(crate) scheduled: AtomicUsize,
    /// Slots currently dispatching or awaiting their outcome.
    pub(crate) executing: AtomicUsize,
    /// Cleared exactly once, at the start of shutdown.
    pub(crate) accepting: AtomicBool,
    pub(crate) metrics: RwLock<SchedulerMetrics>,
    progress_lock: Mutex<()>,
    progress: Condvar,
}

impl SchedulerShared {
    /// Wake anyone waiting on the counters. Called after every decrement.
    pub(crate) fn notify_progress(&self) {
        let _guard = self.progress_lock.lock().unwrap();
        self.progress.notify_all();
    }

    /// Drop a slot out of the live set and account for its terminal state.
    pub(crate) fn remove_slot(&self, id: u64, name: &str, terminal: SlotState) {
        let removed = self.slots.lock().unwrap().remove(&id).is_some();
        if !removed {
            return;
        }
        if let Ok(mut metrics) = self.metrics.write() {
            match terminal {
                SlotState::Retired => metrics.tasks_retired += 1,
                SlotState::Cancelled => metrics.tasks_cancelled += 1,
                _ => {}
            }
        }
        match terminal {
            SlotState::Retired => info!("task '{}' retired", name),
            _ => debug!("task '{}' cancelled", name),
        }
        self.scheduled.fetch_sub(1, Ordering::SeqCst);
        self.notify_progress();
    }

    fn wait_for_quiescence(&self) {
        let mut guard = self.progress_lock.lock().unwrap();
        while self.scheduled.load(Ordering::SeqCst) > 0
            || self.executing.load(Ordering::SeqCst) > 0
        {
            guard = self.progress.wait(guard).unwrap();
        }
    }
}

/// Drives recurring tasks on a shared worker pool.
///
/// Each instance is independent; several schedulers may share one pool, and
/// shutting a scheduler down does not stop the pool. The scheduler has no
/// thread of its own: timers and callbacks all execute on pool threads.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    pub fn new(pool: Arc<WorkerPool>) -> Scheduler {
        Scheduler {
            shared: Arc::new(SchedulerShared {
                pool,
                slots: Mutex::new(HashMap::new()),
                next_slot_id: AtomicU64::new(1),
                scheduled: AtomicUsize::new(0),
                executing: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                metrics: RwLock::new(SchedulerMetrics::default()),
                progress_lock: Mutex::new(()),
                progress: Condvar::new(),
            }),
        }
    }

    /// Submit a recurring task. The first invocation fires after the task's
    /// start delay; every later one fires its repeat delay after the
    /// previous callback completed.
    ///
    /// Fails with [`SchedulerError::ShuttingDown`] once shutdown has begun,
    /// leaving no partial state behind.
    pub fn add_task(&self, task: Task) -> Result<(), SchedulerError> {
        task.validate()?;
        let shared = &self.shared;

        let mut slots = shared.slots.lock().unwrap();
        // Checked under the slot-map lock so no submission can slip past a
        // concurrent shutdown sweep.
        if !shared.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        let id = shared.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = TaskSlot::new(id, task, shared);
        slots.insert(id, Arc::clone(&slot));
        shared.scheduled.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = slot.arm(slot.task.start_delay) {
            slots.remove(&id);
            shared.scheduled.fetch_sub(1, Ordering::SeqCst);
            return Err(SchedulerError::PoolUnavailable(err));
        }
        debug!(
            "task '{}' scheduled (start {:?}, repeat {:?})",
            slot.task.name, slot.task.start_delay, slot.task.repeat_delay
        );
        Ok(())
    }

    /// Number of tasks not yet retired or cancelled.
    pub fn num_scheduled_tasks(&self) -> usize {
        self.shared.scheduled.load(Ordering::SeqCst)
    }

    /// Number of callbacks currently dispatching or awaiting their outcome.
    pub fn num_executing_task_callbacks(&self) -> usize {
        self.shared.executing.load(Ordering::SeqCst)
    }

    /// Snapshot of the execution metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared.metrics.read().unwrap().clone()
    }

    /// Stop accepting tasks, cancel every pending timer, and wait until all
    /// in-flight callbacks have resolved.
    ///
    /// Executing callbacks are never aborted; a callback that never
    /// fulfills its outcome prevents shutdown from returning. Idempotent:
    /// repeat calls skip the sweep but still wait for quiescence.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.accepting.swap(false, Ordering::SeqCst) {
            info!(
                "scheduler shutting down ({} scheduled, {} executing)",
                shared.scheduled.load(Ordering::SeqCst),
                shared.executing.load(Ordering::SeqCst)
            );
            let snapshot: Vec<Arc<TaskSlot>> =
                shared.slots.lock().unwrap().values().cloned().collect();
            for slot in snapshot {
                if slot.cancel(shared) {
                    shared.remove_slot(slot.id, &slot.task.name, SlotState::Cancelled);
                }
            }
        }
        shared.wait_for_quiescence();
        debug!("scheduler shut down");
    }
}
