use std::fmt;
use std::time::Duration;

use meridian_core::{Context, Identity};

use crate::endpoint::Endpoint;

/// How requests through a reference travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InvocationMode {
    #[default]
    Twoway,
    Oneway,
    BatchOneway,
    Datagram,
    BatchDatagram,
}

impl InvocationMode {
    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    pub fn expects_reply(self) -> bool {
        self == InvocationMode::Twoway
    }
}

/// Immutable description of an invocation target
///
/// The `change_*` methods return modified copies. Two equal references
/// share a cached request handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub identity: Identity,
    pub facet: String,
    pub mode: InvocationMode,
    pub secure: bool,
    pub endpoints: Vec<Endpoint>,
    /// Indirect references name an adapter instead of listing endpoints
    pub adapter_id: String,
    pub router: Option<Identity>,
    pub locator: Option<Identity>,
    pub context: Context,
    /// Overrides the connection's invocation timeout
    pub timeout: Option<Duration>,
    pub cache_connection: bool,
    pub collocation_optimized: bool,
}

impl Reference {
    pub fn direct(identity: Identity, endpoints: Vec<Endpoint>) -> Self {
        Self {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            endpoints,
            adapter_id: String::new(),
            router: None,
            locator: None,
            context: Context::new(),
            timeout: None,
            cache_connection: true,
            collocation_optimized: true,
        }
    }

    pub fn indirect(identity: Identity, adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            ..Self::direct(identity, Vec::new())
        }
    }

    /// Endpoints usable for this reference's invocation mode, with the
    /// timeout override applied
    pub fn usable_endpoints(&self) -> Vec<Endpoint> {
        // No secure transport is available
        if self.secure {
            return Vec::new();
        }
        self.endpoints
            .iter()
            .filter(|e| e.datagram() == self.mode.is_datagram())
            .map(|e| match self.timeout {
                Some(timeout) => e.clone().with_timeout(timeout),
                None => e.clone(),
            })
            .collect()
    }

    pub fn change_identity(&self, identity: Identity) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    pub fn change_facet(&self, facet: impl Into<String>) -> Self {
        Self {
            facet: facet.into(),
            ..self.clone()
        }
    }

    pub fn change_mode(&self, mode: InvocationMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    pub fn change_secure(&self, secure: bool) -> Self {
        Self {
            secure,
            ..self.clone()
        }
    }

    pub fn change_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            adapter_id: String::new(),
            ..self.clone()
        }
    }

    pub fn change_adapter_id(&self, adapter_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            endpoints: Vec::new(),
            ..self.clone()
        }
    }

    pub fn change_router(&self, router: Option<Identity>) -> Self {
        Self {
            router,
            ..self.clone()
        }
    }

    pub fn change_locator(&self, locator: Option<Identity>) -> Self {
        Self {
            locator,
            ..self.clone()
        }
    }

    pub fn change_context(&self, context: Context) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    pub fn change_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn change_cache_connection(&self, cache_connection: bool) -> Self {
        Self {
            cache_connection,
            ..self.clone()
        }
    }

    pub fn change_collocation_optimized(&self, collocation_optimized: bool) -> Self {
        Self {
            collocation_optimized,
            ..self.clone()
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)?;
        if !self.facet.is_empty() {
            write!(f, " -f {}", self.facet)?;
        }
        let mode = match self.mode {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        };
        write!(f, " {mode}")?;
        if self.secure {
            f.write_str(" -s")?;
        }
        if !self.adapter_id.is_empty() {
            return write!(f, " @ {}", self.adapter_id);
        }
        for endpoint in &self.endpoints {
            write!(f, ":{endpoint}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_modes_select_udp_endpoints() {
        let reference = Reference::direct(
            Identity::new("foo"),
            vec![Endpoint::tcp("localhost", 1), Endpoint::udp("localhost", 2)],
        );
        assert_eq!(reference.usable_endpoints(), vec![Endpoint::tcp("localhost", 1)]);
        let datagram = reference.change_mode(InvocationMode::Datagram);
        assert_eq!(datagram.usable_endpoints(), vec![Endpoint::udp("localhost", 2)]);
        assert!(reference.change_secure(true).usable_endpoints().is_empty());
    }

    #[test]
    fn changes_produce_distinct_references() {
        let reference = Reference::direct(Identity::new("foo"), vec![Endpoint::tcp("localhost", 1)]);
        let faceted = reference.change_facet("admin");
        assert_ne!(reference, faceted);
        assert_eq!(faceted.change_facet(""), reference);
        assert_eq!(faceted.to_string(), "foo -f admin -t:tcp -h localhost -p 1");
    }
}
