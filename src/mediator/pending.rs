//! Future-like handle for [`Mediator::dispatch_async_pending`](crate::Mediator::dispatch_async_pending).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::DispatchError;

struct Shared<T> {
    outcome: Mutex<Option<Result<T, DispatchError>>>,
    ready: Condvar,
}

/// Result of an asynchronous dispatch, available once the handler has run.
///
/// Waiting on it blocks the calling thread (use [`is_done`](Self::is_done) to
/// poll). Dropping it is fine; the request is still processed.
pub struct PendingResult<T> {
    shared: Arc<Shared<T>>,
}

/// Producer half, fulfilled on the consumer thread
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

pub(crate) fn pending<T>() -> (PendingResult<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        outcome: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        PendingResult {
            shared: Arc::clone(&shared),
        },
        Completer {
            shared: Some(shared),
        },
    )
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, outcome: Result<T, DispatchError>) {
        if let Some(shared) = self.shared.take() {
            Self::fulfil(&shared, outcome);
        }
    }

    fn fulfil(shared: &Shared<T>, outcome: Result<T, DispatchError>) {
        let mut slot = shared.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        shared.ready.notify_all();
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        // Never leave a waiter hanging if the submission is dropped unprocessed.
        if let Some(shared) = self.shared.take() {
            Self::fulfil(&shared, Err(DispatchError::Shutdown));
        }
    }
}

impl<T> PendingResult<T> {
    /// Whether the outcome is available
    pub fn is_done(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// Block until the outcome is available and return it
    pub fn wait(self) -> Result<T, DispatchError> {
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Wait at most `timeout`; on expiry the handle is returned so the caller
    /// can keep waiting later
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, DispatchError>, Self> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return Ok(outcome);
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                if let Some(outcome) = slot.take() {
                    return Ok(outcome);
                }
                drop(slot);
                return Err(self);
            }
        }
    }

    /// Take the outcome if it is already available, otherwise give the handle back
    pub fn try_take(self) -> Result<Result<T, DispatchError>, Self> {
        let taken = self.shared.outcome.lock().take();
        match taken {
            Some(outcome) => Ok(outcome),
            None => Err(self),
        }
    }
}

impl<T> fmt::Debug for PendingResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("done", &self.is_done())
            .finish()
    }
}
