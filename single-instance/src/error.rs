use std::fmt;
use std::io;
use std::time::Duration;

/// Errors that can occur while coordinating instances
#[derive(Debug)]
pub enum Error {
    /// Acquiring or releasing the lock file failed
    LockIo(io::Error),
    /// The lock is held but the listening socket could not be bound
    ChannelBind(io::Error),
    /// The primary instance did not answer in time
    ChannelConnectTimeout(Duration),
    /// The primary went away before acknowledging a handoff
    ChannelClosed,
    /// Handoff payload could not be decoded
    MalformedPayload(String),
    InvalidIdentity(String),
    /// Returned by [`crate::only_single_instance`] after the launch was handed
    /// to the primary instance
    AlreadyRunning,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LockIo(e) => write!(f, "Lock file error: {}", e),
            Error::ChannelBind(e) => write!(f, "Could not bind instance socket: {}", e),
            Error::ChannelConnectTimeout(timeout) => write!(
                f,
                "Primary instance did not answer within {}ms",
                timeout.as_millis()
            ),
            Error::ChannelClosed => {
                write!(f, "Primary closed the connection before acknowledging")
            }
            Error::MalformedPayload(msg) => write!(f, "Malformed handoff payload: {}", msg),
            Error::InvalidIdentity(msg) => write!(f, "Invalid instance identity: {}", msg),
            Error::AlreadyRunning => write!(f, "Another instance is already running"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::LockIo(e) | Error::ChannelBind(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedPayload(e.to_string())
    }
}
