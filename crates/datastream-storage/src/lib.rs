pub mod bookmark;
pub mod engine;
pub mod file;

pub use bookmark::BookmarkIndex;
pub use engine::StreamEngine;
pub use file::{EntryLocation, FileStore, ScannedEntry, StoreReader};
