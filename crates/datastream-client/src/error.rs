//! Client-side error handling.
//!
//! A command rejected by the server surfaces as [`ClientError::Command`]
//! carrying the server's numeric code and error string. A streaming
//! connection that goes away surfaces as end-of-stream to the entry
//! processor and as [`ClientError::ConnectionClosed`] to command callers.

use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(#[from] datastream_core::Error),

    /// The server answered a command with a nonzero Result.
    #[error("server error {code}: {message}")]
    Command { code: u32, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,
}
