//! Message transport abstraction.
//!
//! The connection driver is generic over anything that can move whole
//! [`Message`] values in both directions. Framing and byte encoding belong to
//! the transport (and the external codec behind it); the driver never sees
//! raw bytes.

use std::future::Future;
use std::io;

use tether_wire::Message;

/// A duplex, message-oriented channel.
///
/// Only the connection driver calls `recv()`; all routing happens inside the
/// driver, so implementations do not need internal demultiplexing.
pub trait MessageTransport: Send + 'static {
    /// Send one message.
    fn send(&mut self, msg: Message) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the channel cleanly.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Message>>> + Send;

    /// Shut down both directions. Best effort; errors are swallowed.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
