//! Error types for Bifrost.

use thiserror::Error;

/// Result type alias using Bifrost's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Bifrost operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A size, handle, or enum argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the object's current state
    /// (e.g. writing to a ring that is not open for writing, or using
    /// an expired sequence handle).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The requested memory-space combination is not supported.
    #[error("invalid memory space: {0}")]
    InvalidSpace(String),

    /// A non-blocking operation could not proceed without waiting.
    #[error("operation would block")]
    WouldBlock,

    /// The sequence or input stream is exhausted.
    #[error("end of data")]
    EndOfData,

    /// A blocking operation timed out before data or space appeared.
    #[error("timed out")]
    Timeout,

    /// The ring was interrupted while this thread was parked on it.
    #[error("interrupted")]
    Interrupted,

    /// An opportunistic reader was lapped by the writer.
    ///
    /// `skipped` is the number of requested bytes that were overwritten
    /// before they could be read. The reader's cursor has been advanced
    /// past the damage and it may continue.
    #[error("reader overrun: {skipped} bytes overwritten")]
    Overrun {
        /// Bytes of the request that were lost to the writer.
        skipped: u64,
    },

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The feature is not compiled into this build.
    #[error("not supported in this build: {0}")]
    Unsupported(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if this error is a benign timeout/would-block condition that a
    /// caller can retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Timeout)
    }
}
