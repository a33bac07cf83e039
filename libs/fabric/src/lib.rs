//! Meridian Fabric - connection and invocation engine
//!
//! Carries requests of the Ice 1.0 wire protocol between proxies and object
//! adapters over TCP and UDP: connection state machines, a leader/follower
//! thread pool, synchronous and callback-driven invocations, retries and
//! connection factories.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meridian_core::{Identity, OperationMode};
//! use meridian_fabric::{Communicator, Config, Current, DispatchResult, Endpoint};
//!
//! # fn example() -> meridian_fabric::Result<()> {
//! let server = Communicator::new(Config::default())?;
//! let adapter = server.create_object_adapter("hello", &[Endpoint::tcp("127.0.0.1", 0)])?;
//! adapter.add(
//!     Identity::new("greeter"),
//!     Arc::new(|_: &Current, params: &[u8]| -> DispatchResult { Ok(params.to_vec()) }),
//! )?;
//! adapter.activate()?;
//!
//! let client = Communicator::new(Config::default())?;
//! let greeter = client.proxy(Identity::new("greeter"), adapter.endpoints());
//! let echoed = greeter.invoke("echo", OperationMode::Normal, b"hi")?;
//! assert_eq!(echoed, b"hi");
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod incoming;
pub mod instance;
pub mod monitor;
pub mod outgoing;
pub mod outgoing_async;
pub mod proxy;
pub mod reference;
pub mod request_handler;
pub mod retry;
pub mod thread_pool;
pub mod transport;

// Re-exports for convenience
pub use adapter::ObjectAdapter;
pub use communicator::Communicator;
pub use config::{Config, ConfigBuilder, ThreadPoolConfig};
pub use connection::{Connection, DestructionReason, State};
pub use endpoint::{Endpoint, TransportKind};
pub use error::{Error, RequestFailed, Result};
pub use incoming::{Current, DispatchError, DispatchResult, Servant};
pub use proxy::Proxy;
pub use reference::{InvocationMode, Reference};
