//! Client-side handle on a remote (or collocated) object

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::codec::{BincodeCodec, Codec};
use meridian_core::{Context, Identity, OperationMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::outgoing::{write_request, BatchOutgoing, Outgoing};
use crate::outgoing_async::OutgoingAsync;
use crate::reference::{InvocationMode, Reference};
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct Proxy {
    instance: Arc<Instance>,
    reference: Reference,
}

impl Proxy {
    pub(crate) fn new(instance: Arc<Instance>, reference: Reference) -> Self {
        Self {
            instance,
            reference,
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn identity(&self) -> &Identity {
        &self.reference.identity
    }

    fn with_reference(&self, reference: Reference) -> Self {
        Self {
            instance: self.instance.clone(),
            reference,
        }
    }

    pub fn with_facet(&self, facet: &str) -> Self {
        self.with_reference(self.reference.change_facet(facet))
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        self.with_reference(self.reference.change_mode(mode))
    }

    pub fn twoway(&self) -> Self {
        self.with_mode(InvocationMode::Twoway)
    }

    pub fn oneway(&self) -> Self {
        self.with_mode(InvocationMode::Oneway)
    }

    pub fn batch_oneway(&self) -> Self {
        self.with_mode(InvocationMode::BatchOneway)
    }

    pub fn datagram(&self) -> Self {
        self.with_mode(InvocationMode::Datagram)
    }

    pub fn batch_datagram(&self) -> Self {
        self.with_mode(InvocationMode::BatchDatagram)
    }

    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        self.with_reference(self.reference.change_timeout(timeout))
    }

    pub fn with_context(&self, context: Context) -> Self {
        self.with_reference(self.reference.change_context(context))
    }

    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.with_reference(self.reference.change_endpoints(endpoints))
    }

    pub fn with_adapter_id(&self, adapter_id: &str) -> Self {
        self.with_reference(self.reference.change_adapter_id(adapter_id))
    }

    pub fn with_secure(&self, secure: bool) -> Self {
        self.with_reference(self.reference.change_secure(secure))
    }

    pub fn with_cache_connection(&self, cache: bool) -> Self {
        self.with_reference(self.reference.change_cache_connection(cache))
    }

    pub fn with_collocation_optimized(&self, optimized: bool) -> Self {
        self.with_reference(self.reference.change_collocation_optimized(optimized))
    }

    /// Invoke `operation` and block until its outcome is known.
    ///
    /// Failures that certainly did not execute the request are retried
    /// according to the configured retry intervals.
    pub fn invoke(&self, operation: &str, mode: OperationMode, params: &[u8]) -> Result<Vec<u8>> {
        self.invoke_with_context(operation, mode, params, None)
    }

    /// Like [`invoke`](Self::invoke), replacing the reference's context
    pub fn invoke_with_context(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> Result<Vec<u8>> {
        let first = self.invoke_once(operation, mode, params, context);
        self.retry_after(first, operation, mode, params, context)
    }

    /// Run the retry loop, starting from the outcome of a first attempt
    fn retry_after(
        &self,
        mut outcome: Result<Vec<u8>>,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> Result<Vec<u8>> {
        let policy = RetryPolicy::new(&self.instance.config().retry_intervals);
        let mut retries = 0;
        loop {
            let err = match outcome {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            let delay = policy.check(err, mode, retries)?;
            retries += 1;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            outcome = self.invoke_once(operation, mode, params, context);
        }
    }

    fn invoke_once(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> Result<Vec<u8>> {
        let handler = self
            .instance
            .request_handler_factory()
            .get(&self.reference)?;
        if self.reference.mode.is_batch() {
            BatchOutgoing::invoke(&*handler, &self.reference, operation, mode, context, params)?;
            return Ok(Vec::new());
        }
        let mut os = self.instance.stream_pool().take();
        let result = write_request(&mut os, &self.reference, operation, mode, context, params)
            .and_then(|()| Outgoing::invoke(&*handler, &mut os, self.reference.mode.expects_reply()));
        self.instance.stream_pool().give(os);
        result
    }

    /// Invoke `operation` without blocking; `callback` runs on a client pool
    /// thread with the outcome.
    pub fn invoke_async<F>(&self, operation: &str, mode: OperationMode, params: &[u8], callback: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        if self.reference.mode.is_batch() {
            self.invoke_batch_async(operation, mode, params, callback);
            return;
        }
        let mut os = self.instance.stream_pool().take();
        if let Err(e) = write_request(&mut os, &self.reference, operation, mode, None, params) {
            self.instance.stream_pool().give(os);
            self.instance.client_pool().dispatch(move || callback(Err(e)));
            return;
        }
        let out = OutgoingAsync::new(
            self.instance.clone(),
            self.reference.clone(),
            mode,
            os,
            Box::new(callback),
        );
        out.invoke();
    }

    /// Batch requests are queued inline when the connection is already up.
    /// Anything that could wait (a pending connect, retry delays) runs on a
    /// client pool thread instead of the caller's.
    fn invoke_batch_async<F>(&self, operation: &str, mode: OperationMode, params: &[u8], callback: F)
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        let first = match self.instance.request_handler_factory().get(&self.reference) {
            Ok(handler) if matches!(handler.connection(false), Ok(Some(_))) => Some(
                BatchOutgoing::invoke(&*handler, &self.reference, operation, mode, None, params)
                    .map(|()| Vec::new()),
            ),
            _ => None,
        };
        let first = match first {
            Some(Ok(result)) => {
                self.instance
                    .client_pool()
                    .dispatch(move || callback(Ok(result)));
                return;
            }
            other => other,
        };

        let proxy = self.clone();
        let operation = operation.to_owned();
        let params = params.to_vec();
        self.instance.client_pool().dispatch(move || {
            let result = match first {
                Some(outcome) => proxy.retry_after(outcome, &operation, mode, &params, None),
                None => proxy.invoke(&operation, mode, &params),
            };
            callback(result);
        });
    }

    /// [`invoke_async`](Self::invoke_async) as a future
    pub fn invoke_future(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.invoke_async(operation, mode, params, move |result| {
            let _ = tx.send(result);
        });
        async move { rx.await.unwrap_or(Err(Error::CommunicatorDestroyed)) }
    }

    /// Typed call: parameters and result travel bincode-encoded
    pub fn call<P, R>(&self, operation: &str, mode: OperationMode, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let codec = BincodeCodec;
        let params = codec.encode(params)?;
        let result = self.invoke(operation, mode, &params)?;
        Ok(codec.decode(&result)?)
    }

    /// Check that the object exists and is reachable
    pub fn ping(&self) -> Result<()> {
        self.invoke("ice_ping", OperationMode::Nonmutating, &[])
            .map(|_| ())
    }

    /// Send the requests batched through this proxy's connection
    pub fn flush_batch_requests(&self) -> Result<()> {
        match self.connection()? {
            Some(connection) => connection.flush_batch_requests(),
            None => Ok(()),
        }
    }

    /// Connection requests through this proxy travel on, establishing it if
    /// needed. `None` for collocated objects.
    pub fn connection(&self) -> Result<Option<Arc<Connection>>> {
        self.instance
            .request_handler_factory()
            .get(&self.reference)?
            .connection(true)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Proxy({})", self.reference)
    }
}
