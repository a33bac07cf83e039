use std::sync::Arc;

use meridian_core::Identity;

use crate::adapter::ObjectAdapter;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::proxy::Proxy;
use crate::reference::Reference;

/// Entry point of the runtime
///
/// Owns the I/O runtime, thread pools and connections. Dropping the
/// communicator destroys it.
pub struct Communicator {
    instance: Arc<Instance>,
}

impl Communicator {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            instance: Instance::new(config)?,
        })
    }

    pub fn config(&self) -> &Config {
        self.instance.config()
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Create an adapter listening on `endpoints`. Port 0 binds an ephemeral
    /// port; the adapter's endpoints report the one picked.
    pub fn create_object_adapter(
        &self,
        name: &str,
        endpoints: &[Endpoint],
    ) -> Result<Arc<ObjectAdapter>> {
        if self.instance.is_destroyed() {
            return Err(Error::CommunicatorDestroyed);
        }
        self.instance
            .adapter_factory()
            .create(&self.instance, name, endpoints)
    }

    pub fn find_object_adapter(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.instance.adapter_factory().find(name)
    }

    /// Proxy for `identity` reachable at `endpoints`
    pub fn proxy(&self, identity: Identity, endpoints: Vec<Endpoint>) -> Proxy {
        Proxy::new(
            self.instance.clone(),
            Reference::direct(identity, endpoints),
        )
    }

    /// Proxy for `identity` in the adapter named `adapter_id`
    pub fn indirect_proxy(&self, identity: Identity, adapter_id: &str) -> Proxy {
        Proxy::new(
            self.instance.clone(),
            Reference::indirect(identity, adapter_id),
        )
    }

    /// Send the batched requests of every outgoing connection
    pub fn flush_batch_requests(&self) {
        self.instance.outgoing_connection_factory().flush_batch_requests();
    }

    /// Shut down: deactivate adapters, close connections, fail queued
    /// retries and stop every thread.
    pub fn destroy(&self) {
        self.instance.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.is_destroyed()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.instance.destroy();
    }
}
