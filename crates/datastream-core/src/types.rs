//! Protocol constants and tag types.
//!
//! Every value here is part of the interoperability contract: packet tags,
//! command ids, stream types, and the reserved bookmark entry type. Peers
//! that disagree on any of them cannot talk to each other.

use serde::{Deserialize, Serialize};

/// Leading byte of a Header packet (server to client) and of the file header.
pub const PT_HEADER: u8 = 0x01;

/// Leading byte of a Data (entry) packet.
pub const PT_DATA: u8 = 0x02;

/// Leading byte of a Result packet.
pub const PT_RESULT: u8 = 0xff;

/// On-disk and on-wire size of the stream file header.
pub const HEADER_SIZE: usize = 29;

/// Fixed framing bytes of an entry: tag, length, type, number.
pub const ENTRY_FIXED_SIZE: usize = 17;

/// Fixed framing bytes of a result: tag, length, error number.
pub const RESULT_FIXED_SIZE: usize = 9;

/// File format revision, for the wire handshake of future revisions.
pub const FORMAT_VERSION: u8 = 1;

/// Kind of stream served by a file and a server.
///
/// Sent by clients with every command; the server drops the connection on a
/// mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum StreamType {
    Sequencer = 1,
}

impl StreamType {
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(StreamType::Sequencer),
            _ => None,
        }
    }
}

/// Application-defined tag of an entry payload.
///
/// The log treats payloads as opaque; the single reserved value is
/// [`EntryType::BOOKMARK`], which marks entries whose payload is a bookmark
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryType(pub u32);

impl EntryType {
    /// Reserved type for bookmark entries.
    pub const BOOKMARK: EntryType = EntryType(0xb0);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_bookmark(self) -> bool {
        self == Self::BOOKMARK
    }
}

impl From<u32> for EntryType {
    fn from(value: u32) -> Self {
        EntryType(value)
    }
}

/// Command ids sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum CommandId {
    Start = 1,
    Stop = 2,
    Header = 3,
    Entry = 4,
    Bookmark = 5,
    StartBookmark = 6,
}

impl CommandId {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(CommandId::Start),
            2 => Some(CommandId::Stop),
            3 => Some(CommandId::Header),
            4 => Some(CommandId::Entry),
            5 => Some(CommandId::Bookmark),
            6 => Some(CommandId::StartBookmark),
            _ => None,
        }
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}
