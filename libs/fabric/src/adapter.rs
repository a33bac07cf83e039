//! Object adapters: servant registries bound to incoming endpoints

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use meridian_core::Identity;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::factory::IncomingConnectionFactory;
use crate::incoming::Servant;
use crate::instance::Instance;
use crate::proxy::Proxy;
use crate::reference::Reference;

/// Outcome of looking up a servant
pub enum Located {
    Servant(Arc<dyn Servant>),
    FacetNotExist,
    ObjectNotExist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Holding,
    Active,
    Deactivated,
}

pub struct ObjectAdapter {
    name: String,
    instance: Weak<Instance>,
    servants: Mutex<HashMap<Identity, HashMap<String, Arc<dyn Servant>>>>,
    factories: Mutex<Vec<Arc<IncomingConnectionFactory>>>,
    state: Mutex<AdapterState>,
    cond: Condvar,
}

impl ObjectAdapter {
    pub(crate) fn create(
        instance: &Arc<Instance>,
        name: &str,
        endpoints: &[Endpoint],
    ) -> Result<Arc<Self>> {
        let adapter = Arc::new(Self {
            name: name.to_string(),
            instance: Arc::downgrade(instance),
            servants: Mutex::new(HashMap::new()),
            factories: Mutex::new(Vec::new()),
            state: Mutex::new(AdapterState::Holding),
            cond: Condvar::new(),
        });
        let mut factories = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match IncomingConnectionFactory::new(instance, endpoint, &adapter) {
                Ok(factory) => factories.push(factory),
                Err(e) => {
                    for factory in &factories {
                        factory.destroy();
                    }
                    return Err(e);
                }
            }
        }
        *adapter.factories.lock() = factories;
        debug!(target: "meridian::network", "created object adapter `{name}`");
        Ok(adapter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn incoming_factories(&self) -> Vec<Arc<IncomingConnectionFactory>> {
        self.factories.lock().clone()
    }

    /// Bound endpoints, with ephemeral ports resolved
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.factories
            .lock()
            .iter()
            .map(|f| f.endpoint().clone())
            .collect()
    }

    pub fn add(&self, identity: Identity, servant: Arc<dyn Servant>) -> Result<()> {
        self.add_facet(identity, "", servant)
    }

    pub fn add_facet(
        &self,
        identity: Identity,
        facet: &str,
        servant: Arc<dyn Servant>,
    ) -> Result<()> {
        self.check_deactivated()?;
        let mut servants = self.servants.lock();
        let facets = servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            let mut name = identity.to_string();
            if !facet.is_empty() {
                name = format!("{name} -f {facet}");
            }
            return Err(Error::AlreadyRegistered(name));
        }
        facets.insert(facet.to_string(), servant);
        Ok(())
    }

    pub fn remove(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.remove_facet(identity, "")
    }

    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let mut servants = self.servants.lock();
        let facets = servants.get_mut(identity)?;
        let servant = facets.remove(facet);
        if facets.is_empty() {
            servants.remove(identity);
        }
        servant
    }

    pub(crate) fn locate(&self, identity: &Identity, facet: &str) -> Located {
        if self.is_deactivated() {
            return Located::ObjectNotExist;
        }
        let servants = self.servants.lock();
        match servants.get(identity) {
            None => Located::ObjectNotExist,
            Some(facets) => match facets.get(facet) {
                Some(servant) => Located::Servant(servant.clone()),
                None => Located::FacetNotExist,
            },
        }
    }

    /// Start dispatching requests
    pub fn activate(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                AdapterState::Deactivated => {
                    return Err(Error::ObjectAdapterDeactivated(self.name.clone()))
                }
                AdapterState::Active => return Ok(()),
                AdapterState::Holding => *state = AdapterState::Active,
            }
        }
        for factory in self.incoming_factories() {
            factory.activate();
        }
        Ok(())
    }

    /// Stop reading requests; dispatches in progress continue
    pub fn hold(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == AdapterState::Deactivated {
                return Err(Error::ObjectAdapterDeactivated(self.name.clone()));
            }
            *state = AdapterState::Holding;
        }
        for factory in self.incoming_factories() {
            factory.hold();
        }
        Ok(())
    }

    /// Wait until no dispatch is in progress after [`hold`](Self::hold)
    pub fn wait_for_hold(&self) {
        for factory in self.incoming_factories() {
            factory.wait_until_holding();
        }
    }

    /// Close every incoming connection; pending requests of clients fail and
    /// later requests find the adapter gone.
    pub fn deactivate(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == AdapterState::Deactivated {
                return;
            }
            *state = AdapterState::Deactivated;
            self.cond.notify_all();
        }
        for factory in self.incoming_factories() {
            factory.destroy();
        }
        if let Some(instance) = self.instance.upgrade() {
            instance.outgoing_connection_factory().remove_adapter(self);
            instance.adapter_factory().remove(&self.name);
        }
        debug!(target: "meridian::network", "deactivated object adapter `{}`", self.name);
    }

    /// Wait until [`deactivate`](Self::deactivate) was called and every
    /// incoming connection finished
    pub fn wait_for_deactivate(&self) {
        {
            let mut state = self.state.lock();
            while *state != AdapterState::Deactivated {
                self.cond.wait(&mut state);
            }
        }
        for factory in self.incoming_factories() {
            factory.wait_until_finished();
        }
    }

    pub fn is_deactivated(&self) -> bool {
        *self.state.lock() == AdapterState::Deactivated
    }

    fn check_deactivated(&self) -> Result<()> {
        if self.is_deactivated() {
            Err(Error::ObjectAdapterDeactivated(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Proxy for `identity` through this adapter's endpoints
    pub fn create_proxy(&self, identity: Identity) -> Result<Proxy> {
        self.check_deactivated()?;
        let instance = self
            .instance
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        Ok(Proxy::new(
            instance,
            Reference::direct(identity, self.endpoints()),
        ))
    }

    /// Proxy naming this adapter instead of its endpoints
    pub fn create_indirect_proxy(&self, identity: Identity) -> Result<Proxy> {
        self.check_deactivated()?;
        let instance = self
            .instance
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        Ok(Proxy::new(
            instance,
            Reference::indirect(identity, self.name.clone()),
        ))
    }

    /// Whether requests through `reference` can be dispatched here directly
    pub fn is_local(&self, reference: &Reference) -> bool {
        if self.is_deactivated() {
            return false;
        }
        if !reference.adapter_id.is_empty() {
            return reference.adapter_id == self.name;
        }
        let endpoints = self.endpoints();
        reference.endpoints.iter().any(|candidate| {
            endpoints.iter().any(|local| {
                local.transport == candidate.transport
                    && local.host == candidate.host
                    && local.port == candidate.port
            })
        })
    }

    pub(crate) fn monitor(&self, now: Instant) {
        for factory in self.incoming_factories() {
            factory.monitor(now);
        }
    }
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

/// Registry of the adapters of one communicator
#[derive(Default)]
pub struct ObjectAdapterFactory {
    adapters: Mutex<HashMap<String, Arc<ObjectAdapter>>>,
}

impl ObjectAdapterFactory {
    pub(crate) fn create(
        &self,
        instance: &Arc<Instance>,
        name: &str,
        endpoints: &[Endpoint],
    ) -> Result<Arc<ObjectAdapter>> {
        if self.adapters.lock().contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        let adapter = ObjectAdapter::create(instance, name, endpoints)?;
        let mut adapters = self.adapters.lock();
        if adapters.contains_key(name) {
            drop(adapters);
            adapter.deactivate();
            return Err(Error::AlreadyRegistered(name.to_string()));
        }
        adapters.insert(name.to_string(), adapter.clone());
        Ok(adapter)
    }

    pub fn find(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        self.adapters.lock().get(name).cloned()
    }

    pub(crate) fn find_collocated(&self, reference: &Reference) -> Option<Arc<ObjectAdapter>> {
        let adapters: Vec<_> = self.adapters.lock().values().cloned().collect();
        adapters.into_iter().find(|a| a.is_local(reference))
    }

    pub(crate) fn remove(&self, name: &str) {
        self.adapters.lock().remove(name);
    }

    pub(crate) fn adapters(&self) -> Vec<Arc<ObjectAdapter>> {
        self.adapters.lock().values().cloned().collect()
    }

    pub(crate) fn monitor(&self, now: Instant) {
        for adapter in self.adapters() {
            adapter.monitor(now);
        }
    }

    /// Deactivate every adapter and wait for their connections to finish
    pub(crate) fn destroy(&self) -> Vec<Arc<ObjectAdapter>> {
        let adapters = self.adapters();
        for adapter in &adapters {
            adapter.deactivate();
        }
        adapters
    }
}
