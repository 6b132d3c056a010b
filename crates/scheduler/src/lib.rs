//! Recurring task scheduler over a shared worker pool.
//!
//! A [`Task`] is a named unit of work with a start delay, a repeat delay,
//! and a callback producing a [`Deferred`] outcome. The [`Scheduler`]
//! multiplexes any number of recurring tasks onto a bounded [`WorkerPool`],
//! re-arming each task relative to the *completion* of its previous run, so
//! a slow callback never queues back-to-back invocations of itself.

pub mod deferred;
pub mod pool;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use deferred::{deferred, Deferred, Outcome, Promise, PromiseError};
pub use pool::{PoolConfig, PoolError, TimerHandle, WorkerPool};
pub use scheduler::{
    Scheduler, SchedulerError, SchedulerMetrics, Task, TaskCallback, TaskOutcome,
};
