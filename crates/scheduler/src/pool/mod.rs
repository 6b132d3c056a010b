//! Thin adapter over the worker pool: immediate posts, timed posts, and join.
//!
//! The scheduler interacts with its pool through three operations only:
//! [`WorkerPool::post`], [`WorkerPool::post_after`], and
//! [`WorkerPool::cancel`]. [`WorkerPool::join`] lets an owner wait for the
//! pool to drain; a pending far-future timer counts as outstanding work, so
//! callers cancel timers before joining.

mod timer;

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use self::timer::TimerQueue;
pub use self::timer::TimerHandle;

/// Error type for worker pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to build worker pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to start timer thread: {0}")]
    Timer(#[from] std::io::Error),
    #[error("worker pool is stopped")]
    Stopped,
}

/// Worker pool configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads. 0 = num_cpus.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Prefix for worker thread names.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_worker_threads() -> usize {
    0
}

fn default_thread_name_prefix() -> String {
    "pool-worker".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl PoolConfig {
    /// Config with an explicit thread count and default naming.
    pub fn with_worker_threads(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }
}

/// Count of outstanding work items: posted closures plus pending timers.
#[derive(Default)]
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Keeps one work item accounted for from registration until it finishes.
struct WorkGuard {
    inflight: Arc<Inflight>,
}

impl WorkGuard {
    fn enter(inflight: &Arc<Inflight>) -> WorkGuard {
        if let Ok(mut count) = inflight.count.lock() {
            *count += 1;
        }
        WorkGuard {
            inflight: Arc::clone(inflight),
        }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if let Ok(mut count) = self.inflight.count.lock() {
            *count -= 1;
            if *count == 0 {
                self.inflight.idle.notify_all();
            }
        }
    }
}

/// A bounded pool of worker threads with a timer thread for delayed posts.
///
/// Shared as `Arc<WorkerPool>`; several schedulers may drive work on one
/// pool, and shutting a scheduler down leaves the pool usable.
pub struct WorkerPool {
    workers: Arc<rayon::ThreadPool>,
    timers: Arc<TimerQueue>,
    inflight: Arc<Inflight>,
    timer_thread: Option<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Build the rayon pool and start the timer thread.
    pub fn new(config: PoolConfig) -> Result<WorkerPool, PoolError> {
        let num_threads = config.resolved_worker_threads();
        let prefix = config.thread_name_prefix.clone();
        let workers = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .thread_name(move |i| format!("{}-{}", prefix, i))
                .build()?,
        );
        let timers = Arc::new(TimerQueue::new());

        let timer_workers = Arc::clone(&workers);
        let timer_queue = Arc::clone(&timers);
        let timer_thread = thread::Builder::new()
            .name(format!("{}-timer", config.thread_name_prefix))
            .spawn(move || timer_queue.run(|job| timer_workers.spawn(job)))?;

        debug!("worker pool started with {} threads", num_threads);
        Ok(WorkerPool {
            workers,
            timers,
            inflight: Arc::new(Inflight::default()),
            timer_thread: Some(timer_thread),
        })
    }

    /// Number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.workers.current_num_threads()
    }

    /// Enqueue `work` for immediate execution on some worker thread.
    ///
    /// Two posts from one thread are not required to run in submission
    /// order.
    pub fn post(&self, work: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        if self.timers.is_stopped() {
            return Err(PoolError::Stopped);
        }
        let guard = WorkGuard::enter(&self.inflight);
        self.workers.spawn(move || {
            let _guard = guard;
            work();
        });
        Ok(())
    }

    /// Schedule `work` to execute after `delay`. Zero delay behaves like
    /// [`post`](WorkerPool::post), except the returned handle stays
    /// cancellable until the work is handed to a worker.
    pub fn post_after(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<TimerHandle, PoolError> {
        let guard = WorkGuard::enter(&self.inflight);
        self.timers.schedule(
            delay,
            Box::new(move || {
                let _guard = guard;
                work();
            }),
        )
    }

    /// Cancel a pending timed post. Returns whether the cancellation caught
    /// the entry while it was still pending; `false` means the work was
    /// already handed to a worker and will run. Idempotent.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.timers.cancel(handle)
    }

    /// Block until no work items remain and all workers are idle.
    pub fn join(&self) {
        let mut count = self.inflight.count.lock().unwrap();
        while *count > 0 {
            count = self.inflight.idle.wait(count).unwrap();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.timers.stop();
        if let Some(handle) = self.timer_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::*;

    fn single_thread_pool() -> WorkerPool {
        WorkerPool::new(PoolConfig::with_worker_threads(1)).expect("build worker pool")
    }

    #[test]
    fn post_runs_work() {
        let pool = single_thread_pool();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        pool.post(move || flag.store(true, Ordering::SeqCst)).unwrap();
        pool.join();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn join_waits_for_posted_work() {
        let pool = single_thread_pool();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        pool.post(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        pool.join();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn post_after_respects_the_delay() {
        let pool = single_thread_pool();
        let delay = Duration::from_millis(50);
        let elapsed = Arc::new(Mutex::new(None));

        let recorded = Arc::clone(&elapsed);
        let start = Instant::now();
        pool.post_after(delay, move || {
            *recorded.lock().unwrap() = Some(start.elapsed());
        })
        .unwrap();
        pool.join();

        let elapsed = elapsed.lock().unwrap().expect("timed work ran");
        assert!(elapsed >= delay, "work ran after {:?}, before the {:?} delay", elapsed, delay);
    }

    #[test]
    fn zero_delay_post_after_runs_promptly() {
        let pool = single_thread_pool();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        pool.post_after(Duration::ZERO, move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        pool.join();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_prevents_pending_work() {
        let pool = single_thread_pool();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let handle = pool
            .post_after(Duration::from_millis(200), move || {
                flag.store(true, Ordering::SeqCst)
            })
            .unwrap();
        assert!(pool.cancel(handle));

        // Join must not block on the cancelled entry.
        pool.join();
        thread::sleep(Duration::from_millis(250));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_after_execution_is_a_no_op() {
        let pool = single_thread_pool();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let handle = pool
            .post_after(Duration::ZERO, move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        pool.join();

        assert!(!pool.cancel(handle));
        assert!(!pool.cancel(handle));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let pool = single_thread_pool();
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = Arc::clone(&order);
        pool.post_after(Duration::from_millis(80), move || {
            slow.lock().unwrap().push("slow")
        })
        .unwrap();
        let fast = Arc::clone(&order);
        pool.post_after(Duration::from_millis(10), move || {
            fast.lock().unwrap().push("fast")
        })
        .unwrap();
        pool.join();

        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[test]
    fn many_delayed_posts_all_run() {
        let pool = WorkerPool::new(PoolConfig::with_worker_threads(4)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for i in 0..50 {
            let count = Arc::clone(&count);
            pool.post_after(Duration::from_millis(i % 7), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.join();

        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.thread_name_prefix, "pool-worker");
        // 0 means auto-detect
        assert!(config.resolved_worker_threads() > 0);

        let config = PoolConfig::with_worker_threads(8);
        assert_eq!(config.resolved_worker_threads(), 8);
    }
}
