//! Error classification helpers.

use std::io;

use thiserror::Error;

/// Reports whether `err` is transient and the operation that produced it is
/// worth retrying. Running out of descriptors or losing a connection midway
/// through the TCP handshake are the typical cases for an accept loop.
pub fn is_temporary(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    match err.kind() {
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut => true,
        _ => matches!(
            err.raw_os_error(),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
        ),
    }
}

/// Reports whether `err` resulted from an elapsed deadline.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Builds a synthetic timeout error carrying `msg`. The result satisfies
/// [`is_timeout`].
pub fn timeout(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, msg.to_string())
}

/// Errors produced by line-based protocol handlers.
#[derive(Debug, Error)]
pub enum LineError {
    /// The peer sent a line longer than the handler was configured to read.
    #[error("the line is too long")]
    TooLong,

    /// The peer sent a second line before the first one was answered.
    #[error("pipelining is not supported")]
    NoPipeline,
}
