use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error reply sent by the server (`-ERR ...`).
///
/// This is data, not a transport fault: receiving one leaves the connection
/// usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DataError {
    message: String,
}

impl DataError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Error prefix such as `ERR`, `WRONGTYPE` or `NOAUTH`.
    pub fn kind(&self) -> &str {
        self.message
            .split_ascii_whitespace()
            .next()
            .unwrap_or_default()
    }
}

/// Pool operation that failed, used to build stable error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Borrow,
    ReturnHealthy,
    ReturnBroken,
    Destroy,
}

impl fmt::Display for PoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolOp::Borrow => write!(f, "Could not get a resource from the pool"),
            PoolOp::ReturnHealthy => write!(f, "Could not return the resource to the pool"),
            PoolOp::ReturnBroken => {
                write!(f, "Could not return the broken resource to the pool")
            }
            PoolOp::Destroy => write!(f, "Could not destroy the pool"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Connection is broken and cannot be reused")]
    ConnectionBroken,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("No pending replies to read")]
    NoPendingReplies,

    #[error("{op}: {source}")]
    Pool {
        op: PoolOp,
        #[source]
        source: Box<Error>,
    },

    #[error("Pool exhausted")]
    PoolExhausted,

    #[error("Timed out after {0:?} waiting for an idle resource")]
    PoolTimeout(Duration),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Unable to validate resource")]
    Validation,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn pool(op: PoolOp, source: Error) -> Self {
        Error::Pool {
            op,
            source: Box::new(source),
        }
    }

    /// Transport-level failure. The connection that produced it is broken.
    ///
    /// A failed borrow counts as a connection error, matching how callers
    /// treat "no connection available".
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::ConnectionClosed(_)
            | Error::ConnectionBroken
            | Error::Protocol(_) => true,
            Error::Pool { op, .. } => *op == PoolOp::Borrow,
            _ => false,
        }
    }

    /// Error reply from the server; the connection stays usable.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Error::Data(_))
    }

    pub fn as_data_error(&self) -> Option<&DataError> {
        match self {
            Error::Data(e) => Some(e),
            _ => None,
        }
    }
}
