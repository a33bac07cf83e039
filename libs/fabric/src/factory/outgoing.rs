use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::debug;

use crate::adapter::ObjectAdapter;
use crate::connection::{Connection, DestructionReason};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::instance::Instance;

type Attempt = Option<Result<Arc<Connection>>>;

struct FactoryState {
    connections: HashMap<Endpoint, Vec<Arc<Connection>>>,
    /// Connection attempts in progress, by endpoint
    pending: HashMap<Endpoint, watch::Receiver<Attempt>>,
    destroyed: bool,
}

impl FactoryState {
    fn reap(&mut self) {
        for connections in self.connections.values_mut() {
            connections.retain(|c| !c.is_finished());
        }
        self.connections.retain(|_, connections| !connections.is_empty());
    }

    fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.values().flatten().cloned().collect()
    }
}

enum Step {
    Ready(Arc<Connection>),
    Wait(watch::Receiver<Attempt>),
    Connect(watch::Sender<Attempt>),
}

/// Creates and shares client connections
///
/// At most one connection attempt runs per endpoint; concurrent callers
/// for the same endpoint wait for its outcome.
pub struct OutgoingConnectionFactory {
    instance: Weak<Instance>,
    state: Mutex<FactoryState>,
    cond: Condvar,
}

impl OutgoingConnectionFactory {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            state: Mutex::new(FactoryState {
                connections: HashMap::new(),
                pending: HashMap::new(),
                destroyed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// A validated connection to one of `endpoints`, tried in order
    pub async fn create(&self, endpoints: &[Endpoint]) -> Result<Arc<Connection>> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoint("empty endpoint list".into()));
        }
        loop {
            match self.next_step(endpoints)? {
                Step::Ready(connection) => return Ok(connection),
                Step::Wait(mut attempt) => {
                    let outcome = match attempt.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(Ok(connection)) if connection.is_active_or_holding() => {
                            return Ok(connection)
                        }
                        Some(Err(e)) => return Err(e),
                        _ => continue,
                    }
                }
                Step::Connect(attempt) => {
                    let result = self.connect(endpoints).await;
                    let result = self.register(endpoints, result);
                    attempt.send_replace(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    fn next_step(&self, endpoints: &[Endpoint]) -> Result<Step> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::CommunicatorDestroyed);
        }
        state.reap();

        let existing = endpoints.iter().find_map(|endpoint| {
            state
                .connections
                .get(endpoint)?
                .iter()
                .find(|c| c.is_active_or_holding())
                .cloned()
        });
        if let Some(connection) = existing {
            return Ok(Step::Ready(connection));
        }

        // Attempts abandoned by a cancelled caller leave a closed channel
        state.pending.retain(|_, attempt| attempt.has_changed().is_ok());
        if let Some(attempt) = endpoints.iter().find_map(|e| state.pending.get(e)) {
            return Ok(Step::Wait(attempt.clone()));
        }

        let (sender, receiver) = watch::channel(None);
        for endpoint in endpoints {
            state.pending.insert(endpoint.clone(), receiver.clone());
        }
        Ok(Step::Connect(sender))
    }

    fn register(
        &self,
        endpoints: &[Endpoint],
        result: Result<Arc<Connection>>,
    ) -> Result<Arc<Connection>> {
        let mut state = self.state.lock();
        for endpoint in endpoints {
            state.pending.remove(endpoint);
        }
        self.cond.notify_all();
        let connection = result?;
        if state.destroyed {
            connection.destroy(DestructionReason::CommunicatorDestroyed);
            return Err(Error::CommunicatorDestroyed);
        }
        state
            .connections
            .entry(connection.endpoint().clone())
            .or_default()
            .push(connection.clone());
        Ok(connection)
    }

    async fn connect(&self, endpoints: &[Endpoint]) -> Result<Arc<Connection>> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        let mut last = None;
        for endpoint in endpoints {
            let timeout = endpoint
                .timeout
                .unwrap_or(instance.config().connect_timeout);
            let attempt = async {
                let transceiver = endpoint.connector().connect(timeout).await?;
                let connection =
                    Connection::new(instance.clone(), transceiver, endpoint.clone(), None, false);
                connection.start().await?;
                Ok::<_, Error>(connection)
            };
            match attempt.await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!(target: "meridian::network", "connection to {endpoint} failed: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::NoEndpoint("empty endpoint list".into())))
    }

    /// Blocking variant of [`create`](Self::create)
    pub fn create_blocking(self: &Arc<Self>, endpoints: Vec<Endpoint>) -> Result<Arc<Connection>> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        let factory = self.clone();
        instance.block_on(async move { factory.create(&endpoints).await })?
    }

    /// Copy of the live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.lock();
        state.reap();
        state.all()
    }

    pub fn flush_batch_requests(&self) {
        for connection in self.connections() {
            if connection.is_active_or_holding() {
                if let Err(e) = connection.flush_batch_requests() {
                    debug!(target: "meridian::network", "flushing batch to {} failed: {e}", connection.endpoint());
                }
            }
        }
    }

    pub fn monitor(&self, now: Instant) {
        for connection in self.connections() {
            connection.monitor(now);
        }
    }

    /// Stop routing bidirectional requests to `adapter`
    pub fn remove_adapter(&self, adapter: &Arc<ObjectAdapter>) {
        for connection in self.connections() {
            if connection
                .adapter()
                .is_some_and(|current| Arc::ptr_eq(&current, adapter))
            {
                connection.set_adapter(None);
            }
        }
    }

    pub fn destroy(&self) {
        let connections = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.all()
        };
        for connection in connections {
            connection.destroy(DestructionReason::CommunicatorDestroyed);
        }
    }

    /// Wait until pending attempts settled and every connection finished
    pub fn wait_until_finished(&self) {
        let connections = {
            let mut state = self.state.lock();
            while !state.pending.is_empty() {
                self.cond.wait(&mut state);
            }
            state.all()
        };
        for connection in connections {
            connection.wait_until_finished();
        }
        self.state.lock().connections.clear();
    }
}
