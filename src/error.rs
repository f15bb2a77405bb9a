/*!
Error types

Every failure the relay core can produce. Most of them only ever terminate a
single peer; `Error::is_fatal` singles out the ones the bootstrap layer has to
act on.
*/

use std::io;

use thiserror::Error;

use crate::frame::FrameError;
use crate::registry::Handle;

/// Crate-wide error
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The secure-transport context could not be built.
    #[error("failed to initialize the TLS context: {0}")]
    TlsContext(String),

    /// Listen addresses were configured but none of them could be bound.
    #[error("none of the {0} listen addresses could be bound")]
    NoListener(usize),

    #[error("datagram session failure: {0}")]
    Seal(&'static str),

    #[error("handle {0} is already registered")]
    DuplicateHandle(Handle),

    #[error("connection closed by peer")]
    Closed,

    #[error("device error: {0}")]
    Device(String),
}

impl Error {
    /// Whether this error must be surfaced to the process bootstrap instead
    /// of being absorbed by the peer that caused it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TlsContext(_) | Error::NoListener(_))
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_: ring::error::Unspecified) -> Self {
        Error::Seal("cryptographic operation failed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_context_and_bind_failures_are_fatal() {
        assert!(Error::TlsContext("no entropy".into()).is_fatal());
        assert!(Error::NoListener(2).is_fatal());
        assert!(!Error::Closed.is_fatal());
        assert!(!Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
        assert!(!Error::Frame(FrameError::TooLarge { size: 70000, max: 65535 }).is_fatal());
    }
}
