//! Connection setup and the user-facing handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tether_wire::Exception;

use crate::cap::Client;
use crate::driver::{ConnTask, ConnTx, Driver, QuestionRef};
use crate::queue::{pipeline_client, ResponseCell, ResponseSink};
use crate::transport::MessageTransport;

/// Connection configuration.
pub struct Options {
    /// Capability served to peer `Bootstrap` requests.
    pub bootstrap: Option<Client>,
    /// Label for the remote peer, used only in diagnostics.
    pub peer: Option<String>,
    /// Maximum wall time spent pushing `Abort` during shutdown.
    pub abort_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bootstrap: None,
            peer: None,
            abort_timeout: Duration::from_millis(100),
        }
    }
}

/// Start a connection over a message transport.
///
/// Returns a handle for making calls and the driver future, which must be
/// spawned to make any progress:
///
/// ```ignore
/// let (handle, driver) = tether_rpc::connect(transport, Options::default());
/// tokio::spawn(driver.run());
/// let remote_root = handle.bootstrap();
/// ```
pub fn connect<T: MessageTransport>(io: T, options: Options) -> (ConnectionHandle, Driver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = ConnTx::new(tx);
    let driver = Driver::new(
        io,
        conn.clone(),
        rx,
        options.bootstrap,
        options.peer.unwrap_or_else(|| "-".into()),
        options.abort_timeout,
    );
    (ConnectionHandle { conn }, driver)
}

/// Handle for one connection. Cheap to clone; usable from any task.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: ConnTx,
}

impl ConnectionHandle {
    /// Ask the peer for its bootstrap capability.
    ///
    /// The returned client is usable immediately; calls made before the
    /// bootstrap answer arrives are pipelined on the wire. After the
    /// connection closes this returns a client that fails with
    /// `Disconnected`.
    pub fn bootstrap(&self) -> Client {
        let cell = Arc::new(ResponseCell::new());
        let question = Arc::new(QuestionRef::new(self.conn.clone()));
        let task = ConnTask::Bootstrap {
            question: question.clone(),
            sink: ResponseSink::Cell(cell.clone()),
        };
        if self.conn.send(task).is_err() {
            return Client::broken(Exception::disconnected("connection closed"));
        }
        pipeline_client(self.conn.clone(), question, cell, Vec::new())
    }

    /// Close the connection. Outstanding calls complete with `Disconnected`;
    /// capabilities that already shortened into this vat keep working.
    pub fn close(&self) {
        let _ = self.conn.send(ConnTask::Close);
    }
}
