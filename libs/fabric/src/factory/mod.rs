//! Connection factories
//!
//! Outgoing connections are shared per endpoint by the communicator; incoming
//! connections belong to the adapter endpoint that accepted them.

mod incoming;
mod outgoing;

pub use self::incoming::IncomingConnectionFactory;
pub use self::outgoing::OutgoingConnectionFactory;
