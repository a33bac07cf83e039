use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::adapter::ObjectAdapter;
use crate::connection::{Connection, DestructionReason};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::thread_pool::{
    wait_finished, wait_reading, EventHandler, HandlerId, Interest, IoCompletion, ThreadPool,
};
use crate::transport::{Acceptor, Transceiver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FactoryState {
    Holding,
    Active,
    Closed,
}

struct Inner {
    state: FactoryState,
    connections: Vec<Arc<Connection>>,
    /// The acceptor has been released by the thread pool
    finished: bool,
}

impl Inner {
    fn reap(&mut self) {
        self.connections.retain(|c| !c.is_finished());
    }
}

/// Accepts connections for one endpoint of an object adapter
///
/// Stream endpoints register their acceptor with the server thread pool;
/// datagram endpoints get a single connection bound to the endpoint.
pub struct IncomingConnectionFactory {
    instance: Weak<Instance>,
    adapter: Weak<ObjectAdapter>,
    adapter_name: String,
    endpoint: Endpoint,
    pool: Arc<ThreadPool>,
    acceptor_id: OnceLock<HandlerId>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl IncomingConnectionFactory {
    /// Bind `endpoint` for `adapter`; the factory starts out holding
    pub(crate) fn new(
        instance: &Arc<Instance>,
        endpoint: &Endpoint,
        adapter: &Arc<ObjectAdapter>,
    ) -> Result<Arc<Self>> {
        if endpoint.datagram() {
            let local = endpoint.clone();
            let (transceiver, endpoint) =
                instance.block_on(async move { local.bind_datagram().await })??;
            let factory = Self::with_endpoint(instance, endpoint.clone(), adapter, true);
            let connection =
                Connection::new(instance.clone(), transceiver, endpoint, Some(adapter.clone()), true);
            factory.inner.lock().connections.push(connection.clone());
            instance.block_on(async move { connection.start().await })??;
            return Ok(factory);
        }

        let local = endpoint.clone();
        let acceptor = instance.block_on(async move { local.acceptor().await })??;
        let factory = Self::with_endpoint(instance, acceptor.local_endpoint().clone(), adapter, false);
        let (id, interest) = factory.pool.register(factory.clone());
        let _ = factory.acceptor_id.set(id);
        instance.handle().spawn(accept_loop(
            factory.pool.clone(),
            id,
            acceptor,
            interest,
        ));
        Ok(factory)
    }

    fn with_endpoint(
        instance: &Arc<Instance>,
        endpoint: Endpoint,
        adapter: &Arc<ObjectAdapter>,
        finished: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance: Arc::downgrade(instance),
            adapter: Arc::downgrade(adapter),
            adapter_name: adapter.name().to_string(),
            endpoint,
            pool: instance.server_pool().clone(),
            acceptor_id: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: FactoryState::Holding,
                connections: Vec::new(),
                finished,
            }),
            cond: Condvar::new(),
        })
    }

    /// Endpoint actually bound
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Copy of the live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner.reap();
        inner.connections.clone()
    }

    pub fn activate(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state != FactoryState::Holding {
                return;
            }
            inner.state = FactoryState::Active;
            inner.connections.clone()
        };
        if let Some(id) = self.acceptor_id.get() {
            self.pool.set_interest(*id, Interest::Reading);
        }
        for connection in connections {
            connection.activate();
        }
    }

    pub fn hold(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state != FactoryState::Active {
                return;
            }
            inner.state = FactoryState::Holding;
            inner.connections.clone()
        };
        if let Some(id) = self.acceptor_id.get() {
            self.pool.set_interest(*id, Interest::Paused);
        }
        for connection in connections {
            connection.hold();
        }
    }

    /// Stop accepting and gracefully close every connection
    pub fn destroy(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            if inner.state == FactoryState::Closed {
                return;
            }
            inner.state = FactoryState::Closed;
            inner.connections.clone()
        };
        if let Some(id) = self.acceptor_id.get() {
            self.pool.finish(*id);
        }
        for connection in connections {
            connection.destroy(DestructionReason::ObjectAdapterDeactivated(
                self.adapter_name.clone(),
            ));
        }
    }

    /// Wait until no connection is dispatching
    pub fn wait_until_holding(&self) {
        for connection in self.connections() {
            connection.wait_until_holding();
        }
    }

    /// Wait until the acceptor and every connection are released
    pub fn wait_until_finished(&self) {
        let connections = {
            let mut inner = self.inner.lock();
            while !inner.finished {
                self.cond.wait(&mut inner);
            }
            inner.connections.clone()
        };
        for connection in connections {
            connection.wait_until_finished();
        }
        self.inner.lock().connections.clear();
    }

    pub fn monitor(&self, now: Instant) {
        for connection in self.connections() {
            connection.monitor(now);
        }
    }

    fn accepted(self: &Arc<Self>, transceiver: Box<dyn Transceiver>) {
        let (Some(instance), Some(adapter)) = (self.instance.upgrade(), self.adapter.upgrade()) else {
            return;
        };
        let connection = {
            let mut inner = self.inner.lock();
            if inner.state == FactoryState::Closed {
                return;
            }
            inner.reap();
            let connection = Connection::new(
                instance.clone(),
                transceiver,
                self.endpoint.clone(),
                Some(adapter),
                true,
            );
            inner.connections.push(connection.clone());
            connection
        };

        let factory = Arc::downgrade(self);
        instance.handle().spawn(async move {
            if let Err(e) = connection.start().await {
                debug!(target: "meridian::network", "connection validation failed: {e}");
                return;
            }
            if let Some(factory) = factory.upgrade() {
                // Activation may have raced with validation
                if factory.inner.lock().state == FactoryState::Active {
                    connection.activate();
                }
            }
        });
    }
}

impl EventHandler for IncomingConnectionFactory {
    fn message(self: Arc<Self>, completion: IoCompletion) {
        if let IoCompletion::Accepted(transceiver) = completion {
            self.accepted(transceiver);
        }
    }

    fn exception(self: Arc<Self>, err: Error) {
        warn!(target: "meridian::network", "acceptor for {} failed: {err}", self.endpoint);
    }

    fn finished(self: Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.finished = true;
        self.cond.notify_all();
        debug!(target: "meridian::network", "stopped accepting {} connections at {}", self.endpoint.transport.as_str(), self.endpoint);
    }

    fn description(&self) -> String {
        format!("acceptor for {}", self.endpoint)
    }
}

async fn accept_loop(
    pool: Arc<ThreadPool>,
    id: HandlerId,
    acceptor: Box<dyn Acceptor>,
    mut interest: watch::Receiver<Interest>,
) {
    loop {
        if !wait_reading(&mut interest).await {
            return;
        }
        let accepted = tokio::select! {
            accepted = acceptor.accept() => accepted,
            _ = wait_finished(&mut interest) => return,
        };
        match accepted {
            Ok(transceiver) => pool.ready(id, IoCompletion::Accepted(transceiver)),
            Err(e) => {
                warn!(target: "meridian::network", "failed to accept connection at {}: {e}", acceptor.local_endpoint());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
