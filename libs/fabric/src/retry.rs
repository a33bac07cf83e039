//! Retry decisions and delayed resends of asynchronous invocations

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use meridian_core::OperationMode;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::Error;
use crate::outgoing_async::OutgoingAsync;

/// Decides whether a failed invocation is tried again
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy<'a> {
    intervals: &'a [i32],
}

impl<'a> RetryPolicy<'a> {
    /// `intervals` holds the delay in milliseconds before each retry; a
    /// leading `-1` disables retries.
    pub fn new(intervals: &'a [i32]) -> Self {
        Self { intervals }
    }

    /// Maximum number of retries
    pub fn limit(&self) -> usize {
        match self.intervals.first() {
            Some(-1) | None => 0,
            Some(_) => self.intervals.len(),
        }
    }

    /// Delay before the next attempt, or the error to surface.
    ///
    /// `retries` is the number of retries already made.
    pub fn check(&self, err: Error, mode: OperationMode, retries: usize) -> Result<Duration, Error> {
        if !is_retryable(&err, mode) {
            return Err(err);
        }
        if retries >= self.limit() {
            debug!(target: "meridian::retry", "cannot retry operation call because retry limit has been exceeded\n{err}");
            return Err(err);
        }
        let delay = Duration::from_millis(self.intervals[retries].max(0) as u64);
        debug!(
            target: "meridian::retry",
            "retrying operation call in {}ms because of exception\n{err}",
            delay.as_millis()
        );
        Ok(delay)
    }
}

/// Failures after which the request certainly did not execute, plus
/// possibly executed ones when the operation may run twice.
fn is_retryable(err: &Error, mode: OperationMode) -> bool {
    match err {
        Error::NonRepeatable(cause) => mode.is_idempotent() && is_retryable(cause, mode),
        other => other.is_transient(),
    }
}

struct RetryState {
    entries: HashMap<u64, (Arc<OutgoingAsync>, AbortHandle)>,
    next_id: u64,
    destroyed: bool,
}

/// Asynchronous invocations waiting for their next attempt
pub struct RetryQueue {
    handle: Handle,
    state: Mutex<RetryState>,
    weak: Weak<RetryQueue>,
}

impl RetryQueue {
    pub fn new(handle: Handle) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            handle,
            state: Mutex::new(RetryState {
                entries: HashMap::new(),
                next_id: 0,
                destroyed: false,
            }),
            weak: weak.clone(),
        })
    }

    /// Resend `out` after `delay`
    pub fn add(&self, out: Arc<OutgoingAsync>, delay: Duration) {
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            out.complete(Err(Error::CommunicatorDestroyed));
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        let queue = self.weak.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.fire(id);
            }
        });
        state.entries.insert(id, (out, task.abort_handle()));
    }

    fn fire(&self, id: u64) {
        let entry = self.state.lock().entries.remove(&id);
        if let Some((out, _)) = entry {
            out.retry();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every queued retry; each invocation fails with
    /// [`Error::CommunicatorDestroyed`] before this returns.
    pub fn destroy(&self) {
        let entries: Vec<_> = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for (out, task) in entries {
            task.abort();
            out.complete(Err(Error::CommunicatorDestroyed));
        }
    }
}
