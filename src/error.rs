use std::fmt;
use std::io;

/// The error taxonomy surfaced to callbacks and synchronous accessors.
///
/// `WouldBlock` is deliberately absent: it is an internal-only signal used
/// between a syscall attempt and the Slot arming logic, and must never
/// reach a user callback (see `Reactor`/`net` module docs).
#[derive(Debug)]
pub enum Error {
    /// An in-flight operation was aborted by closing its endpoint.
    Cancelled,
    /// A timed operation expired before completing.
    Timeout,
    /// The peer closed the connection, or a read returned zero bytes.
    Eof,
    /// The endpoint or reactor was closed before the operation completed.
    Closed,
    /// A bad address, network string, or interface name.
    InvalidArgument(String),
    /// An unclassified OS error, including `EPIPE`/`ECONNRESET`.
    System(io::Error),
}

impl Error {
    pub(crate) fn would_block(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock
    }

    /// True for the platform errors a peer disconnecting can produce.
    /// `async_write_all` treats these as terminal, per the taxonomy's
    /// explicit note that `{EPIPE, ECONNRESET}` are platform-dependent and
    /// both classify as `System`.
    pub fn is_peer_reset(&self) -> bool {
        match self {
            Error::System(e) => matches!(
                e.raw_os_error(),
                Some(libc::EPIPE) | Some(libc::ECONNRESET)
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Eof => write!(f, "end of file"),
            Error::Closed => write!(f, "endpoint closed"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::System(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Eof
        } else {
            Error::System(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
