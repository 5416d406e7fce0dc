pub mod codec;
pub mod error;
pub mod types;

pub use codec::{Entry, Header, ResultPacket};
pub use error::{Error, Result};
pub use types::{CommandId, EntryType, StreamType};
