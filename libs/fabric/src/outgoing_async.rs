//! Callback-driven invocations
//!
//! An [`OutgoingAsync`] never blocks its caller. It keeps the marshaled
//! request so it can be resent by the retry queue, and hands the outcome to
//! its callback on a client pool thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use meridian_core::{BasicStream, OperationMode};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::incoming::panic_message;
use crate::instance::Instance;
use crate::outgoing::{decode_reply, OutgoingMessageCallback};
use crate::reference::Reference;
use crate::retry::RetryPolicy;

/// Receives the outcome of an asynchronous invocation
pub type Callback = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

struct AsyncState {
    callback: Option<Callback>,
    retries: usize,
    /// Connection and request id of the attempt in flight
    in_flight: Option<(Arc<Connection>, i32)>,
    attempt: u64,
    timer: Option<AbortHandle>,
    done: bool,
}

pub struct OutgoingAsync {
    instance: Arc<Instance>,
    reference: Reference,
    mode: OperationMode,
    os: Mutex<BasicStream>,
    state: Mutex<AsyncState>,
    weak: Weak<OutgoingAsync>,
}

impl OutgoingAsync {
    /// `os` holds a complete request frame
    pub(crate) fn new(
        instance: Arc<Instance>,
        reference: Reference,
        mode: OperationMode,
        os: BasicStream,
        callback: Callback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            instance,
            reference,
            mode,
            os: Mutex::new(os),
            state: Mutex::new(AsyncState {
                callback: Some(callback),
                retries: 0,
                in_flight: None,
                attempt: 0,
                timer: None,
                done: false,
            }),
            weak: weak.clone(),
        })
    }

    fn response(&self) -> bool {
        self.reference.mode.expects_reply()
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Copy of the marshaled request frame
    pub(crate) fn request_frame(&self) -> BasicStream {
        let mut copy = self.instance.stream_pool().take();
        copy.write_blob(self.os.lock().as_bytes());
        copy
    }

    /// Start (or restart) the invocation
    pub fn invoke(self: &Arc<Self>) {
        let result = self
            .instance
            .request_handler_factory()
            .get(&self.reference)
            .and_then(|handler| handler.send_async_request(self));
        if let Err(e) = result {
            self.handle_failure(e, false);
        }
    }

    /// Called by the retry queue when the delay elapsed
    pub(crate) fn retry(self: &Arc<Self>) {
        self.invoke();
    }

    /// Queue the request on `connection`
    pub(crate) fn send_on(self: &Arc<Self>, connection: &Arc<Connection>) -> Result<()> {
        let callback: Arc<dyn OutgoingMessageCallback> = self.clone();
        let request_id = {
            let mut os = self.os.lock();
            connection.send_request(&mut os, Some(callback), self.response())?
        };
        if !self.response() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.done {
            return Ok(());
        }
        state.attempt += 1;
        state.in_flight = Some((connection.clone(), request_id));
        let timeout = self.reference.timeout.or(connection.timeout());
        if let Some(timeout) = timeout {
            let attempt = state.attempt;
            let out = self.weak.clone();
            let timer = self.instance.handle().spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(out) = out.upgrade() {
                    out.timed_out(attempt);
                }
            });
            state.timer = Some(timer.abort_handle());
        }
        Ok(())
    }

    fn timed_out(&self, attempt: u64) {
        let in_flight = {
            let mut state = self.state.lock();
            if state.done || state.attempt != attempt {
                return;
            }
            state.in_flight.take()
        };
        if let Some((connection, request_id)) = in_flight {
            if connection.abandon_request(request_id) {
                self.complete(Err(Error::Timeout.non_repeatable()));
            }
        }
    }

    /// Retry or fail after `err`
    pub(crate) fn handle_failure(self: &Arc<Self>, err: Error, sent: bool) {
        let err = if sent { err.non_repeatable() } else { err };
        let retries = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.in_flight = None;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.retries
        };
        let config = self.instance.config();
        match RetryPolicy::new(&config.retry_intervals).check(err, self.mode, retries) {
            Ok(delay) => {
                self.state.lock().retries += 1;
                self.instance.retry_queue().add(self.clone(), delay);
            }
            Err(err) => self.complete(Err(err)),
        }
    }

    /// Deliver the outcome; only the first call has an effect
    pub(crate) fn complete(&self, result: Result<Vec<u8>>) {
        let callback = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            state.in_flight = None;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.callback.take()
        };
        let Some(callback) = callback else {
            return;
        };
        self.instance.client_pool().dispatch(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(result))) {
                warn!(
                    target: "meridian::thread_pool",
                    "exception raised by invocation callback: {}",
                    panic_message(payload.as_ref())
                );
            }
        });
    }
}

impl OutgoingMessageCallback for OutgoingAsync {
    fn sent(&self) {
        if !self.response() {
            self.complete(Ok(Vec::new()));
        }
    }

    fn finished(&self, mut reply: BasicStream) {
        let result = decode_reply(&mut reply);
        self.instance.stream_pool().give(reply);
        self.complete(result);
    }

    fn failed(&self, err: Error, sent: bool) {
        if let Some(out) = self.weak.upgrade() {
            out.handle_failure(err, sent);
        }
    }
}
