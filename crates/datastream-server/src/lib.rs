pub mod codec;
pub mod error;
pub mod hub;
pub mod server;

pub use codec::{Command, CommandDecoder};
pub use error::{ServerError, ServerResult};
pub use hub::{ClientStatus, ConnId, StreamHub, Subscription};
pub use server::{BoundStreamServer, ServerConfig, StreamServer};
