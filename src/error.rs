use std::{error, fmt, io};

/// All error conditions this crate can surface.
///
/// Every variant maps directly to one of the error kinds called out by the
/// protocol design: connection-level failures are isolated to a single
/// connection, while the others are raised to whichever façade (client,
/// worker, admin) was waiting on the affected operation.
#[derive(Debug)]
pub enum GearmanError {
    /// A socket-level failure or protocol-level disconnect on one connection.
    Connection(String),
    /// No usable connection existed in the configured server list.
    ServerUnavailable(String),
    /// A client request exhausted its connection retry budget.
    ExceededConnectionAttempts(String),
    /// A malformed frame was received; the owning connection is aborted.
    Protocol(String),
    /// A client-side protocol invariant was violated (e.g. JOB_CREATED with
    /// no pending request).
    InvalidClientState(String),
    /// An admin-side protocol invariant was violated, or the admin client
    /// timed out waiting for a response.
    InvalidAdminClientState(String),
    /// The peer sent a command this handler has no `recv_*` method for.
    UnknownCommand(String),
    /// Wraps the underlying OS error from a socket or pipe operation.
    Io(io::Error),
}

impl fmt::Display for GearmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::ServerUnavailable(msg) => write!(f, "server unavailable: {msg}"),
            Self::ExceededConnectionAttempts(msg) => {
                write!(f, "exceeded connection attempts: {msg}")
            },
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::InvalidClientState(msg) => write!(f, "invalid client state: {msg}"),
            Self::InvalidAdminClientState(msg) => {
                write!(f, "invalid admin client state: {msg}")
            },
            Self::UnknownCommand(msg) => write!(f, "unknown command: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl error::Error for GearmanError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GearmanError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl GearmanError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors that represent a single dead connection rather than a
    /// request-level or configuration-level failure.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, GearmanError>;
