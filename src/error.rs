//! Error taxonomy for the reactor core.
use std::fmt;
use std::io;

use thiserror::Error;

/// Compact POSIX-errno taxonomy used throughout the core.
///
/// `EINPROGRESS`, `EWOULDBLOCK` and `ENOBUFS` all collapse into [`ErrorKind::Other`]
/// at the call site before a [`SocketError`] is ever constructed from them; by the
/// time an error reaches user code it has already resolved to a terminal kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ErrorKind {
    /// No error. A [`SocketError`] of this kind is falsy.
    #[default]
    Success,
    /// The peer performed an orderly shutdown.
    Eof,
    /// An operation (connect, DNS) exceeded its deadline.
    Timeout,
    /// The remote end refused the connection.
    Refused,
    /// Name resolution failed.
    Dns,
    /// The local side initiated the shutdown.
    Shutdown,
    /// Anything else, including unclassified I/O errors.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Eof => "eof",
            Self::Timeout => "timeout",
            Self::Refused => "refused",
            Self::Dns => "dns",
            Self::Shutdown => "shutdown",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// An error surfaced to user callbacks (`onErr`), socket operations and server
/// teardown paths.
///
/// Conceptually truthy when `kind() != ErrorKind::Success`; callers should
/// prefer [`SocketError::is_success`] over matching on `kind()` directly.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct SocketError {
    kind: ErrorKind,
    message: String,
}

impl SocketError {
    /// Construct a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The synthetic error emitted by [`crate::session::SessionHelper`] when its
    /// owning server has already been dropped.
    pub fn server_shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "server shutdown")
    }

    /// The error emitted when a connect or send-buffer deadline elapses.
    pub fn timeout(what: &str) -> Self {
        Self::new(ErrorKind::Timeout, format!("{what} timed out"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `true` for [`ErrorKind::Success`].
    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::Success
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::Refused,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            _ => ErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Top-level error for operations that cross the reactor/pool/dns boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error not yet classified into a [`SocketError`].
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A socket-layer error.
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// A task or command channel disconnected.
    #[error("channel disconnected")]
    Disconnected,

    /// Name resolution failed.
    #[error("dns resolution failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: trust_dns_resolver::error::ResolveError,
    },

    /// The reactor the caller expected to exist is gone.
    #[error("reactor is no longer running")]
    ReactorGone,
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        Self::Disconnected
    }
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        Self::Disconnected
    }
}
