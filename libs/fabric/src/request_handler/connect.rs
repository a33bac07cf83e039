use std::sync::Arc;
use std::time::Duration;

use meridian_core::BasicStream;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::outgoing::OutgoingMessageCallback;
use crate::outgoing_async::OutgoingAsync;
use crate::reference::Reference;
use crate::request_handler::{ConnectionRequestHandler, RequestHandler, SentRequest};

enum Progress {
    Connecting(Vec<Arc<OutgoingAsync>>),
    Connected(Arc<Connection>),
    Failed(Error),
}

/// Handler for a reference whose connection is still being established
///
/// Synchronous callers block until the connection attempt settles.
/// Asynchronous requests are queued and sent, or failed, once it does.
pub struct ConnectRequestHandler {
    reference: Reference,
    instance: Arc<Instance>,
    progress: Mutex<Progress>,
    cond: Condvar,
}

impl ConnectRequestHandler {
    /// Start connecting to the first reachable of `endpoints`
    pub(crate) fn start(
        reference: Reference,
        instance: Arc<Instance>,
        endpoints: Vec<Endpoint>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            reference,
            instance: instance.clone(),
            progress: Mutex::new(Progress::Connecting(Vec::new())),
            cond: Condvar::new(),
        });
        let factory = instance.outgoing_connection_factory().clone();
        let pending = handler.clone();
        instance.handle().spawn(async move {
            let result = factory.create(&endpoints).await;
            pending.settle(result);
        });
        handler
    }

    fn settle(&self, result: Result<Arc<Connection>>) {
        let queued = {
            let mut progress = self.progress.lock();
            let next = match &result {
                Ok(connection) => Progress::Connected(connection.clone()),
                Err(e) => Progress::Failed(e.clone()),
            };
            let queued = match std::mem::replace(&mut *progress, next) {
                Progress::Connecting(queued) => queued,
                _ => Vec::new(),
            };
            self.cond.notify_all();
            queued
        };
        trace!(
            target: "meridian::network",
            "connection attempt for `{}` settled, flushing {} queued requests",
            self.reference.identity,
            queued.len()
        );
        for out in queued {
            match &result {
                Ok(connection) => {
                    if let Err(e) = out.send_on(connection) {
                        out.handle_failure(e, false);
                    }
                }
                Err(e) => out.handle_failure(e.clone(), false),
            }
        }
    }

    fn wait_connection(&self) -> Result<Arc<Connection>> {
        let mut progress = self.progress.lock();
        loop {
            match &*progress {
                Progress::Connecting(_) => self.cond.wait(&mut progress),
                Progress::Connected(connection) => return Ok(connection.clone()),
                Progress::Failed(e) => return Err(e.clone()),
            }
        }
    }
}

impl RequestHandler for ConnectRequestHandler {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn send_request(
        &self,
        os: &mut BasicStream,
        out: Arc<dyn OutgoingMessageCallback>,
        response: bool,
    ) -> Result<SentRequest> {
        let connection = self.wait_connection()?;
        let request_id = connection.send_request(os, Some(out), response)?;
        Ok(SentRequest {
            connection: Some(connection),
            request_id,
        })
    }

    fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<()> {
        let connection = {
            let mut progress = self.progress.lock();
            match &mut *progress {
                Progress::Connecting(queued) => {
                    queued.push(out.clone());
                    return Ok(());
                }
                Progress::Connected(connection) => connection.clone(),
                Progress::Failed(e) => return Err(e.clone()),
            }
        };
        out.send_on(&connection)
    }

    fn prepare_batch_request(&self) -> Result<BasicStream> {
        self.wait_connection()?.prepare_batch_request()
    }

    fn finish_batch_request(&self, os: BasicStream) -> Result<()> {
        self.wait_connection()?.finish_batch_request(os)
    }

    fn abort_batch_request(&self, os: BasicStream) {
        if let Ok(connection) = self.wait_connection() {
            connection.abort_batch_request(os);
        }
    }

    fn connection(&self, wait: bool) -> Result<Option<Arc<Connection>>> {
        if wait {
            return self.wait_connection().map(Some);
        }
        match &*self.progress.lock() {
            Progress::Connected(connection) => Ok(Some(connection.clone())),
            Progress::Failed(e) => Err(e.clone()),
            Progress::Connecting(_) => Ok(None),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        if let Some(timeout) = self.reference.timeout {
            return Some(timeout);
        }
        match &*self.progress.lock() {
            Progress::Connected(connection) => connection.timeout(),
            _ => self.instance.config().invocation_timeout,
        }
    }

    fn is_valid(&self) -> bool {
        match &*self.progress.lock() {
            Progress::Connecting(_) => true,
            Progress::Connected(connection) => connection.is_active_or_holding(),
            Progress::Failed(_) => false,
        }
    }

    fn settled(&self) -> Option<Arc<dyn RequestHandler>> {
        match &*self.progress.lock() {
            Progress::Connected(connection) => Some(Arc::new(ConnectionRequestHandler::new(
                self.reference.clone(),
                connection.clone(),
            ))),
            _ => None,
        }
    }
}
