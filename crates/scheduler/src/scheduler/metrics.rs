use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler execution metrics, snapshotted via
/// [`Scheduler::metrics`](super::Scheduler::metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Completed callback invocations by task name.
    pub callbacks_completed: HashMap<String, u64>,
    /// Rolling average callback duration by task name.
    pub avg_callback_duration: HashMap<String, Duration>,
    /// Last completion time by task name.
    pub last_completed: HashMap<String, DateTime<Utc>>,
    /// Tasks that ended by returning the terminate outcome.
    pub tasks_retired: u64,
    /// Tasks cancelled by shutdown.
    pub tasks_cancelled: u64,
}

impl SchedulerMetrics {
    /// Record a completed callback invocation.
    pub fn record_execution(&mut self, task_name: &str, duration: Duration) {
        *self
            .callbacks_completed
            .entry(task_name.to_string())
            .or_default() += 1;
        self.last_completed.insert(task_name.to_string(), Utc::now());

        let count = self.callbacks_completed[task_name];
        let prev_avg = self
            .avg_callback_duration
            .get(task_name)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            Duration::from_nanos((prev_nanos + (cur_nanos - prev_nanos) / count as f64) as u64)
        };
        self.avg_callback_duration
            .insert(task_name.to_string(), new_avg);
    }
}
