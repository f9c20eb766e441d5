use std::io;

/// Errors returned by the fallible public surfaces of the crate.
///
/// Most of the library reports failures through callbacks or retries them
/// internally; this type covers setup-time operations such as address
/// resolution and socket creation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An underlying socket or descriptor operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Hostname resolution failed.
    #[error("failed to resolve host {0:?}")]
    Resolve(String),
    /// The given string is not a valid `ip:port` endpoint.
    #[error("invalid address {0:?}")]
    InvalidAddr(String),
}

pub type Result<T> = std::result::Result<T, Error>;
