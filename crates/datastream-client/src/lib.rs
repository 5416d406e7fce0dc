pub mod client;
pub mod error;

pub use client::{DiscardEntries, EntryProcessor, StreamClient};
pub use error::{ClientError, ClientResult};
