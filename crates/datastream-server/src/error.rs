//! Server-side error handling.
//!
//! Failures split into two classes. Command failures travel back to the
//! client inside a Result packet and leave the connection open. Everything
//! in [`ServerError`] is fatal to the connection: protocol violations get
//! no Result at all, the socket just closes.

use thiserror::Error;

pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(#[from] datastream_core::Error),

    /// Client sent a stream type other than the one this server serves.
    #[error("stream type mismatch: client sent {0}")]
    StreamTypeMismatch(u64),

    #[error("unknown command id {0}")]
    UnknownCommand(u64),

    #[error("bookmark key of {0} bytes exceeds the limit")]
    KeyTooLarge(u32),

    /// The per-connection send queue filled up; the client is dropped
    /// rather than allowed to stall the rest of the server.
    #[error("client send queue saturated")]
    Overloaded,

    #[error("connection closed")]
    ConnectionClosed,
}
