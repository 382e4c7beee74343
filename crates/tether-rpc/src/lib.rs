#![deny(unsafe_code)]

//! Level-1 capability-RPC connection core.
//!
//! One [`Driver`] task per connection owns the four protocol tables
//! (questions, answers, imports, exports) and the transport; cloneable
//! handles submit work through a FIFO task channel. Capabilities are
//! [`Client`]s: local servers, imported proxies, or promises whose calls
//! buffer until resolution. Promise pipelining, loopback embargoes, and
//! distributed reference counting follow the published Cap'n Proto RPC
//! protocol at Level 1; the byte-level codec and framing are external
//! collaborators behind [`MessageTransport`].

mod cap;
mod connection;
mod driver;
mod errors;
mod queue;
mod tables;
pub mod transport;

pub use cap::{Answer, Client, IncomingCall, Params, Resolver, Results, Server};
pub use connection::{connect, ConnectionHandle, Options};
pub use driver::Driver;
pub use errors::ConnectionError;
pub use transport::MessageTransport;

pub use tether_wire as wire;
pub use tether_wire::{ErrorKind, Exception};

/// Hard cap on pipeline transform length; longer transforms abort the
/// connection.
pub(crate) const MAX_PIPELINE_OPS: usize = 64;

#[cfg(test)]
mod tests;
