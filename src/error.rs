use std::io;

/// Unified error type for every fallible operation in this crate.
///
/// Mirrors the error taxonomy of the system this crate replaces: each
/// variant maps to a signed "errno-style" code via [`Error::errno`] for
/// callers that still need to interoperate with a C ABI boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Null/missing required input, or an operation attempted in an
    /// inconsistent state (e.g. `capture` while not streaming).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Allocation failed (buffer ring, profile, event ring).
    #[error("out of memory")]
    OutOfMemory,
    /// A name, role or control id could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),
    /// The policy gate denied the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// Non-blocking ioctl had nothing available.
    #[error("would block")]
    WouldBlock,
    /// ioctl was aborted by a signal or by closing the descriptor from
    /// another thread.
    #[error("interrupted")]
    Interrupted,
    /// Any other kernel error, with the originating `io::Error` preserved.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Malformed profile document or KLV payload.
    #[error("parse error: {0}")]
    ParseError(String),
    /// Driver lacks a requested capability (e.g. frame-interval negotiation).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns the negative errno-style code used at the ABI boundary.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -libc::EINVAL,
            Error::OutOfMemory => -libc::ENOMEM,
            Error::NotFound(_) => -libc::ENOENT,
            Error::AccessDenied(_) => -libc::EACCES,
            Error::WouldBlock => -libc::EWOULDBLOCK,
            Error::Interrupted => -libc::EINTR,
            Error::Io(err) => err.raw_os_error().map_or(-libc::EIO, |e| -e),
            Error::ParseError(_) => -libc::EINVAL,
            Error::Unsupported(_) => -libc::ENOSYS,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::Interrupted => Error::Interrupted,
            _ => Error::Io(err),
        }
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
