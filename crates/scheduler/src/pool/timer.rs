//! Deadline table driven by a dedicated timer thread.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::pool::PoolError;

/// Handle to a pending timed post, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub(crate) type TimerJob = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    job: TimerJob,
}

struct TimerTable {
    entries: HashMap<u64, TimerEntry>,
    next_handle: u64,
    stopped: bool,
}

/// Pending timed posts, keyed by handle. The timer thread sleeps until the
/// nearest deadline and hands due jobs to the dispatch function.
pub(crate) struct TimerQueue {
    table: Mutex<TimerTable>,
    tick: Condvar,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            table: Mutex::new(TimerTable {
                entries: HashMap::new(),
                next_handle: 1,
                stopped: false,
            }),
            tick: Condvar::new(),
        }
    }

    /// Register `job` to run after `delay`. A zero delay is legal; the entry
    /// is due immediately but stays cancellable until the timer thread hands
    /// it off.
    pub(crate) fn schedule(&self, delay: Duration, job: TimerJob) -> Result<TimerHandle, PoolError> {
        let mut table = self.table.lock().unwrap();
        if table.stopped {
            return Err(PoolError::Stopped);
        }
        let handle = table.next_handle;
        table.next_handle += 1;
        table.entries.insert(
            handle,
            TimerEntry {
                deadline: Instant::now() + delay,
                job,
            },
        );
        self.tick.notify_one();
        Ok(TimerHandle(handle))
    }

    /// Drop a pending entry. Returns whether the entry was still here;
    /// `false` means the job was already handed off (or the handle was
    /// cancelled before). Idempotent.
    pub(crate) fn cancel(&self, handle: TimerHandle) -> bool {
        match self.table.lock() {
            Ok(mut table) => table.entries.remove(&handle.0).is_some(),
            Err(_) => false,
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.table.lock().map(|table| table.stopped).unwrap_or(true)
    }

    /// Refuse new entries and drop the pending ones; wakes the timer thread
    /// so it can exit.
    pub(crate) fn stop(&self) {
        if let Ok(mut table) = self.table.lock() {
            table.stopped = true;
            table.entries.clear();
        }
        self.tick.notify_all();
    }

    /// Timer thread body: hand due jobs to `dispatch` until stopped.
    pub(crate) fn run(&self, dispatch: impl Fn(TimerJob)) {
        let mut table = self.table.lock().unwrap();
        loop {
            if table.stopped {
                return;
            }

            let now = Instant::now();
            let due: Vec<u64> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(handle, _)| *handle)
                .collect();
            if !due.is_empty() {
                let jobs: Vec<TimerJob> = due
                    .iter()
                    .filter_map(|handle| table.entries.remove(handle))
                    .map(|entry| entry.job)
                    .collect();
                // Dispatch outside the lock so new entries can land meanwhile.
                drop(table);
                for job in jobs {
                    dispatch(job);
                }
                table = self.table.lock().unwrap();
                continue;
            }

            let next_deadline = table.entries.values().map(|entry| entry.deadline).min();
            table = match next_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    self.tick.wait_timeout(table, timeout).unwrap().0
                }
                None => self.tick.wait(table).unwrap(),
            };
        }
    }
}
