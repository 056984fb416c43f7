//! Error types shared across the exchange substrate.

/// Errors surfaced by chains, emitters, iterators and the transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection loss, short write, or any other transport failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed or unexpected wire frame, or misuse of a channel id.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// `next()` was called on an iterator with no element available.
    #[error("iterator exhausted")]
    Exhausted,

    /// An operation was attempted on an endpoint that is already closed.
    #[error("endpoint closed")]
    Closed,

    /// An internal contract was violated.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
