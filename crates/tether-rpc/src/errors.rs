use std::io;

use tether_wire::Exception;

/// Error terminating a connection driver.
#[derive(Debug)]
pub enum ConnectionError {
    /// IO error on the underlying transport.
    Io(io::Error),
    /// We detected a protocol violation and aborted the connection.
    ProtocolViolation {
        /// Human-readable description of the violation.
        context: String,
    },
    /// The peer aborted the connection.
    Aborted(Exception),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {e}"),
            ConnectionError::ProtocolViolation { context } => {
                write!(f, "protocol violation: {context}")
            }
            ConnectionError::Aborted(e) => write!(f, "connection aborted by peer: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}
