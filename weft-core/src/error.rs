//! Weft Error Types
//!
//! Every fallible engine operation returns [`WeftError`]. Steady-state socket
//! failures are additionally sorted by [`classify`] into the outcomes the
//! managers act on.

use std::io;
use thiserror::Error;

use crate::connection::ConnectionId;
use crate::endpoint::EndpointError;

/// Main error type for Weft operations
#[derive(Error, Debug)]
pub enum WeftError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A backend refused to register a socket
    #[error("Failed to register socket {fd} with {backend}: {source}")]
    Registration {
        fd: i32,
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    /// Descriptor does not fit in an `fd_set`
    #[error("Socket {fd} exceeds select capacity (descriptors must be below {max})")]
    SelectCapacity { fd: i32, max: usize },

    /// Outbound payload contains the frame terminator
    #[error("Message contains the frame terminator at offset {0}")]
    EmbeddedTerminator(usize),

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Connection no longer accepts traffic
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// Every manager refused the socket
    #[error("No event manager accepted the connection")]
    NoManagerAvailable,

    /// Manager worker thread has exited
    #[error("Event manager {0} has shut down")]
    ManagerClosed(usize),

    /// Backend not compiled for this platform
    #[error("Backend {0} is not supported on this platform")]
    UnsupportedBackend(&'static str),

    /// Address could not be parsed
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Result type alias for Weft operations
pub type Result<T> = std::result::Result<T, WeftError>;

impl WeftError {
    /// Wrap a registration failure for `backend`.
    pub fn registration(fd: i32, backend: &'static str, source: io::Error) -> Self {
        Self::Registration { fd, backend, source }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => classify(e) == IoDisposition::Retry,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Io(e) => classify(e) == IoDisposition::Disconnect,
            Self::ConnectionClosed(_) | Self::MessageTooLarge { .. } => true,
            _ => false,
        }
    }
}

/// What a manager does with a failed socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDisposition {
    /// No progress this iteration; try again later.
    Retry,
    /// Peer went away; close quietly.
    Disconnect,
    /// Unexpected failure; log it and tear the connection down.
    Fatal,
}

/// Sort an I/O error into the manager's failure taxonomy.
#[must_use]
pub fn classify(err: &io::Error) -> IoDisposition {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => IoDisposition::Retry,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => IoDisposition::Disconnect,
        _ => IoDisposition::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_retry() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(classify(&err), IoDisposition::Retry);
        assert!(WeftError::from(err).is_recoverable());
    }

    #[test]
    fn reset_is_graceful_disconnect() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(classify(&err), IoDisposition::Disconnect);

        let err = WeftError::from(io::Error::from_raw_os_error(libc::ECONNABORTED));
        assert!(err.is_connection_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn other_errors_are_fatal() {
        let err = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify(&err), IoDisposition::Fatal);
    }

    #[test]
    fn registration_error_mentions_backend() {
        let err = WeftError::registration(
            7,
            "poll",
            io::Error::from_raw_os_error(libc::EINVAL),
        );
        let text = err.to_string();
        assert!(text.contains("socket 7"));
        assert!(text.contains("poll"));
    }
}
