//! Error types shared across the datastream crates.
//!
//! The stream file, the engine, and the wire protocol all report failures
//! through this closed set of kinds. Each kind has a stable numeric code
//! that travels inside Result packets as `error_num` (0 is reserved for OK),
//! so a client can map a remote failure back to the same kind.

use thiserror::Error;

/// Result type used throughout the datastream crates.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Wire or file bytes fail framing.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Stream file header does not match what this process expects.
    #[error("incompatible stream file: {0}")]
    Incompatible(String),

    /// Entry-number gap or length mismatch found while scanning the file.
    #[error("corrupt stream file: {0}")]
    Corrupt(String),

    /// Command or atomic-op call issued out of state-machine order.
    #[error("bad state: {0}")]
    BadState(String),

    /// Entry number past the end of the log, or unknown bookmark.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A client stopped draining its send queue.
    #[error("client send queue saturated")]
    Overloaded,
}

impl Error {
    /// Numeric code carried as `error_num` in Result packets.
    pub fn code(&self) -> u32 {
        match self {
            Error::Malformed(_) => 1,
            Error::Incompatible(_) => 2,
            Error::Corrupt(_) => 3,
            Error::BadState(_) => 4,
            Error::NotFound(_) => 5,
            Error::Io(_) => 6,
            Error::Overloaded => 7,
        }
    }
}
