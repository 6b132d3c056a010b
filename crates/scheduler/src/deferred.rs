//! One-shot handoff between a producer and a single consumer.
//!
//! [`deferred`] returns a [`Promise`] / [`Deferred`] pair sharing one cell.
//! The producer fulfills the cell at most once; the consumer observes the
//! outcome exactly once, either by blocking ([`Deferred::wait`]) or by
//! registering a continuation ([`Deferred::then`]) that runs on whichever
//! thread fulfills the cell.

use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

/// Error observed through a deferred value's producer or consumer side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// The producer side was fulfilled more than once.
    #[error("deferred value fulfilled more than once")]
    AlreadyFulfilled,
    /// The producer reported a failure instead of a value.
    #[error("producer failed: {0}")]
    Failed(String),
    /// The producer was dropped before fulfilling.
    #[error("producer dropped before fulfillment")]
    Broken,
}

/// What the consumer side observes: a value or a failure indicator.
pub type Outcome<T> = Result<T, PromiseError>;

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum CellState<T> {
    /// Not yet fulfilled; holds the continuation if one was registered.
    Pending(Option<Continuation<T>>),
    /// Fulfilled; the outcome waits to be observed.
    Ready(Outcome<T>),
    /// The outcome was handed to the consumer.
    Observed,
}

struct Cell<T> {
    state: Mutex<CellState<T>>,
    ready: Condvar,
}

/// Create a fresh producer/consumer pair sharing one cell.
pub fn deferred<T>() -> (Promise<T>, Deferred<T>) {
    let cell = Arc::new(Cell {
        state: Mutex::new(CellState::Pending(None)),
        ready: Condvar::new(),
    });
    (Promise { cell: Arc::clone(&cell) }, Deferred { cell })
}

/// Producer side of a deferred value.
///
/// Dropping an unfulfilled promise fulfills it with
/// [`PromiseError::Broken`], so a consumer can never wait forever on a
/// producer that went away.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Promise<T> {
    /// Set the outcome. Later calls return `AlreadyFulfilled`.
    pub fn fulfill(&self, value: T) -> Result<(), PromiseError> {
        self.complete(Ok(value))
    }

    /// Set a failure indicator instead of a value.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), PromiseError> {
        self.complete(Err(PromiseError::Failed(reason.into())))
    }

    fn complete(&self, outcome: Outcome<T>) -> Result<(), PromiseError> {
        let mut state = self.cell.state.lock().unwrap();
        match std::mem::replace(&mut *state, CellState::Observed) {
            CellState::Pending(Some(continuation)) => {
                // Run the continuation outside the lock; it may do real work.
                drop(state);
                continuation(outcome);
                Ok(())
            }
            CellState::Pending(None) => {
                *state = CellState::Ready(outcome);
                self.cell.ready.notify_all();
                Ok(())
            }
            previous => {
                *state = previous;
                Err(PromiseError::AlreadyFulfilled)
            }
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let mut state = match self.cell.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if matches!(*state, CellState::Pending(_)) {
            match std::mem::replace(&mut *state, CellState::Observed) {
                CellState::Pending(Some(continuation)) => {
                    drop(state);
                    continuation(Err(PromiseError::Broken));
                }
                CellState::Pending(None) => {
                    *state = CellState::Ready(Err(PromiseError::Broken));
                    self.cell.ready.notify_all();
                }
                _ => {}
            }
        }
    }
}

/// Consumer side of a deferred value.
pub struct Deferred<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Deferred<T> {
    /// An already-fulfilled value, for callbacks that complete inline.
    pub fn ready(value: T) -> Deferred<T> {
        let (promise, consumer) = deferred();
        let _ = promise.fulfill(value);
        consumer
    }

    /// An already-failed value.
    pub fn failed(reason: impl Into<String>) -> Deferred<T> {
        let (promise, consumer) = deferred();
        let _ = promise.fail(reason);
        consumer
    }

    /// Block until the producer fulfills, then return the outcome.
    pub fn wait(self) -> Outcome<T> {
        let mut state = self.cell.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, CellState::Observed) {
                CellState::Ready(outcome) => return outcome,
                pending @ CellState::Pending(_) => {
                    *state = pending;
                    state = self.cell.ready.wait(state).unwrap();
                }
                CellState::Observed => unreachable!("deferred value observed twice"),
            }
        }
    }

    /// Register a continuation invoked exactly once with the outcome.
    ///
    /// If the cell is already fulfilled the continuation runs inline on the
    /// calling thread; otherwise it runs on whichever thread fulfills the
    /// cell.
    pub fn then(self, f: impl FnOnce(Outcome<T>) + Send + 'static) {
        let mut state = self.cell.state.lock().unwrap();
        match std::mem::replace(&mut *state, CellState::Observed) {
            CellState::Ready(outcome) => {
                drop(state);
                f(outcome);
            }
            CellState::Pending(_) => {
                *state = CellState::Pending(Some(Box::new(f)));
            }
            CellState::Observed => unreachable!("deferred value observed twice"),
        }
    }
}
