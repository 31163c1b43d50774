use std::io;

use thiserror::Error;

/// Errors returned by the bridge entry points and the io_uring reactor.
#[derive(Debug, Error)]
pub enum Error {
    /// `connect` or `attach_fd` was called without a handler object.
    #[error("a callback object (handler) must be provided")]
    MissingHandler,
    /// `listen` was called with neither a handler factory nor a block.
    #[error("a handler factory or block is required")]
    MissingFactory,
    /// The reactor refused the listening socket. The cause is logged, not surfaced.
    #[error("failed to listen to requested address, unknown error.")]
    Listen,
    /// Duplicating the caller's descriptor failed.
    #[error("invalid fd: {0}")]
    InvalidFd(#[source] io::Error),
    /// Reactor I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Ring setup failed (e.g., io_uring unavailable).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// No free socket slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
}

impl Error {
    /// Caller supplied bad arguments; raised before any reactor registration.
    pub fn is_argument(&self) -> bool {
        matches!(self, Error::MissingHandler | Error::MissingFactory)
    }

    /// Descriptor or socket level failure.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::InvalidFd(_) | Error::Io(_))
    }
}
