//! Strategies turning "call this operation on that reference" into bytes on
//! a connection, or into a direct in-process dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use meridian_core::BasicStream;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::outgoing::OutgoingMessageCallback;
use crate::outgoing_async::OutgoingAsync;
use crate::reference::Reference;

mod collocated;
mod connect;

pub use self::collocated::CollocatedRequestHandler;
pub use self::connect::ConnectRequestHandler;

/// Where a synchronous request went
pub struct SentRequest {
    /// `None` for collocated requests
    pub connection: Option<Arc<Connection>>,
    /// 0 for oneways
    pub request_id: i32,
}

pub trait RequestHandler: Send + Sync {
    fn reference(&self) -> &Reference;

    /// Send a request frame, waiting for a pending connection if needed
    fn send_request(
        &self,
        os: &mut BasicStream,
        out: Arc<dyn OutgoingMessageCallback>,
        response: bool,
    ) -> Result<SentRequest>;

    /// Send or queue an asynchronous request without blocking
    fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<()>;

    fn prepare_batch_request(&self) -> Result<BasicStream>;

    fn finish_batch_request(&self, os: BasicStream) -> Result<()>;

    fn abort_batch_request(&self, os: BasicStream);

    /// Connection requests travel on; `wait` blocks on a pending connect
    fn connection(&self, wait: bool) -> Result<Option<Arc<Connection>>>;

    /// How long a twoway request waits for its reply
    fn timeout(&self) -> Option<Duration>;

    /// Whether requests can still go through this handler
    fn is_valid(&self) -> bool;

    /// Replacement for a handler whose pending work has settled
    fn settled(&self) -> Option<Arc<dyn RequestHandler>> {
        None
    }
}

/// Handler bound to one established connection
pub struct ConnectionRequestHandler {
    reference: Reference,
    connection: Arc<Connection>,
}

impl ConnectionRequestHandler {
    pub fn new(reference: Reference, connection: Arc<Connection>) -> Self {
        Self {
            reference,
            connection,
        }
    }
}

impl RequestHandler for ConnectionRequestHandler {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn send_request(
        &self,
        os: &mut BasicStream,
        out: Arc<dyn OutgoingMessageCallback>,
        response: bool,
    ) -> Result<SentRequest> {
        let request_id = self.connection.send_request(os, Some(out), response)?;
        Ok(SentRequest {
            connection: Some(self.connection.clone()),
            request_id,
        })
    }

    fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<()> {
        out.send_on(&self.connection)
    }

    fn prepare_batch_request(&self) -> Result<BasicStream> {
        self.connection.prepare_batch_request()
    }

    fn finish_batch_request(&self, os: BasicStream) -> Result<()> {
        self.connection.finish_batch_request(os)
    }

    fn abort_batch_request(&self, os: BasicStream) {
        self.connection.abort_batch_request(os)
    }

    fn connection(&self, _wait: bool) -> Result<Option<Arc<Connection>>> {
        Ok(Some(self.connection.clone()))
    }

    fn timeout(&self) -> Option<Duration> {
        self.reference.timeout.or(self.connection.timeout())
    }

    fn is_valid(&self) -> bool {
        self.connection.is_active_or_holding()
    }
}

/// Hands out request handlers, caching one per reference
pub struct RequestHandlerFactory {
    instance: Weak<Instance>,
    handlers: Mutex<HashMap<Reference, Arc<dyn RequestHandler>>>,
}

impl RequestHandlerFactory {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, reference: &Reference) -> Result<Arc<dyn RequestHandler>> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        if instance.is_destroyed() {
            return Err(Error::CommunicatorDestroyed);
        }

        if reference.collocation_optimized {
            if let Some(adapter) = instance.adapter_factory().find_collocated(reference) {
                return Ok(Arc::new(CollocatedRequestHandler::new(
                    reference.clone(),
                    instance.clone(),
                    adapter,
                )));
            }
        }

        let mut handlers = self.handlers.lock();
        if reference.cache_connection {
            if let Some(handler) = handlers.get(reference).cloned() {
                if handler.is_valid() {
                    if let Some(settled) = handler.settled() {
                        handlers.insert(reference.clone(), settled.clone());
                        return Ok(settled);
                    }
                    return Ok(handler);
                }
                handlers.remove(reference);
            }
        }

        let endpoints = reference.usable_endpoints();
        if endpoints.is_empty() {
            return Err(Error::NoEndpoint(reference.to_string()));
        }
        let handler: Arc<dyn RequestHandler> =
            ConnectRequestHandler::start(reference.clone(), instance, endpoints);
        if reference.cache_connection {
            handlers.insert(reference.clone(), handler.clone());
        }
        Ok(handler)
    }

    /// Evict `handler` if it is still the cached one
    pub fn remove(&self, reference: &Reference, handler: &Arc<dyn RequestHandler>) {
        let mut handlers = self.handlers.lock();
        if handlers
            .get(reference)
            .is_some_and(|cached| Arc::ptr_eq(cached, handler))
        {
            handlers.remove(reference);
        }
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}
