//! Completion signals for work units.
//!
//! A work unit finishes either synchronously (returning a ready signal, or
//! no signal at all) or asynchronously through an [`AsyncSignal`] handle it
//! completes later, from any thread. Whoever owns the [`Signal`] registers
//! exactly one callback, and the signal guarantees that callback runs
//! exactly once, whether it was attached before or after completion.

use crate::errors::WorkflowError;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// The settled outcome of one work unit: a value, or an error.
///
/// `Ok(Value::Null)` models "completed with nothing to report".
pub type Outcome = Result<Value, WorkflowError>;

/// Continuation invoked when a work unit settles.
pub type Callback = Box<dyn FnOnce(Outcome) + Send>;

/// A completion signal returned by [`WorkUnit::start`](crate::WorkUnit::start).
#[derive(Debug)]
pub enum Signal {
    /// The work already finished; the outcome is available now.
    Ready(Outcome),
    /// The work finishes later; the paired [`AsyncSignal`] resolves it.
    Deferred(Arc<AsyncSignal>),
}

impl Signal {
    /// A signal that already succeeded with `value`.
    #[must_use]
    pub fn ready(value: Value) -> Self {
        Self::Ready(Ok(value))
    }

    /// A signal that already failed with `error`.
    #[must_use]
    pub fn failed(error: WorkflowError) -> Self {
        Self::Ready(Err(error))
    }

    /// Bridges a future to a deferred signal.
    ///
    /// The future is driven on the ambient tokio runtime; the signal
    /// resolves with its output. Must be called from within a runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let handle = Arc::new(AsyncSignal::new());
        let resolver = Arc::clone(&handle);
        tokio::spawn(async move {
            resolver.complete(future.await);
        });
        Self::Deferred(handle)
    }

    /// Registers the single continuation for this signal.
    ///
    /// A ready signal fires the callback immediately on the calling thread;
    /// a deferred signal hands it to the async handle.
    pub fn set_callback(self, callback: Callback) {
        match self {
            Self::Ready(outcome) => callback(outcome),
            Self::Deferred(handle) => handle.set_callback(callback),
        }
    }
}

/// State of an [`AsyncSignal`]: completion and callback registration each
/// happen at most once, in either order.
enum AsyncState {
    /// Neither completed nor awaited.
    Idle,
    /// Callback registered, completion pending.
    Waiting(Callback),
    /// Completed before a callback was registered.
    Done(Outcome),
    /// Completed and callback delivered.
    Finished,
}

impl std::fmt::Debug for AsyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Waiting(_) => "Waiting",
            Self::Done(_) => "Done",
            Self::Finished => "Finished",
        };
        f.write_str(name)
    }
}

/// A single-assignment, thread-safe completion handle.
///
/// The first [`complete`](Self::complete) call wins; later calls are
/// silently ignored and the originally recorded outcome never changes.
/// Registering a second callback panics.
#[derive(Debug)]
pub struct AsyncSignal {
    state: Mutex<AsyncState>,
}

impl AsyncSignal {
    /// Creates a handle in the pending state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AsyncState::Idle),
        }
    }

    /// Settles the signal with `outcome`. Only the first call takes effect.
    ///
    /// If a callback is already registered it is invoked on the calling
    /// thread, outside the internal lock.
    pub fn complete(&self, outcome: Outcome) {
        let fire = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, AsyncState::Finished) {
                AsyncState::Idle => {
                    *state = AsyncState::Done(outcome);
                    None
                }
                AsyncState::Waiting(callback) => Some((callback, outcome)),
                done @ AsyncState::Done(_) => {
                    // duplicate complete call; the first outcome stands
                    *state = done;
                    None
                }
                AsyncState::Finished => None,
            }
        };
        if let Some((callback, outcome)) = fire {
            callback(outcome);
        }
    }

    /// Settles the signal successfully with `value`.
    pub fn success(&self, value: Value) {
        self.complete(Ok(value));
    }

    /// Settles the signal with a failure.
    pub fn fail(&self, error: WorkflowError) {
        self.complete(Err(error));
    }

    /// Registers the single continuation.
    ///
    /// If the signal already completed, the callback runs immediately with
    /// the recorded outcome.
    ///
    /// # Panics
    ///
    /// Panics if a callback has already been registered.
    pub fn set_callback(&self, callback: Callback) {
        let fire = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, AsyncState::Finished) {
                AsyncState::Idle => {
                    *state = AsyncState::Waiting(callback);
                    None
                }
                AsyncState::Done(outcome) => Some((callback, outcome)),
                AsyncState::Waiting(_) | AsyncState::Finished => {
                    panic!("callback has already been set")
                }
            }
        };
        if let Some((callback, outcome)) = fire {
            callback(outcome);
        }
    }

    /// Returns true once the signal has settled.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(
            &*self.state.lock(),
            AsyncState::Done(_) | AsyncState::Finished
        )
    }
}

impl Default for AsyncSignal {
    fn default() -> Self {
        Self::new()
    }
}
