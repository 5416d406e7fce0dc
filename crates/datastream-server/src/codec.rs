//! Client command framing.
//!
//! Commands arrive as raw big-endian integer sequences, not tagged packets:
//!
//! ```text
//! +------------------+--------------------+------------------------+
//! | command id (u64) | stream type (u64)  | command argument       |
//! +------------------+--------------------+------------------------+
//! ```
//!
//! `Start` and `Entry` carry one extra u64. `Bookmark` and `StartBookmark`
//! carry a length-prefixed byte string (u32 length, then the key bytes).
//! `Stop` and `Header` have no argument.
//!
//! A stream-type mismatch or an unknown command id is a fatal decode error;
//! the connection is dropped without a Result.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use datastream_core::{CommandId, StreamType};

use crate::error::ServerError;

/// Upper bound on a bookmark key on the wire.
const MAX_BOOKMARK_KEY: u32 = 64 * 1024;

/// A fully parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { from_entry: u64 },
    Stop,
    Header,
    Entry { entry_number: u64 },
    Bookmark { key: Bytes },
    StartBookmark { key: Bytes },
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for the command id and stream type.
    Head,
    /// Waiting for the u64 argument of Start or Entry.
    U64Arg(CommandId),
    /// Waiting for the key length of Bookmark or StartBookmark.
    KeyLen(CommandId),
    /// Waiting for the key bytes themselves.
    KeyBytes(CommandId, usize),
}

/// Stateful decoder for the command stream of one connection.
pub struct CommandDecoder {
    stream_type: StreamType,
    state: DecodeState,
}

impl CommandDecoder {
    pub fn new(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            state: DecodeState::Head,
        }
    }
}

impl Decoder for CommandDecoder {
    type Item = Command;
    type Error = ServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, ServerError> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < 16 {
                        return Ok(None);
                    }
                    let id = src.get_u64();
                    let stream_type = src.get_u64();
                    if stream_type != self.stream_type.as_u64() {
                        return Err(ServerError::StreamTypeMismatch(stream_type));
                    }
                    let command =
                        CommandId::from_u64(id).ok_or(ServerError::UnknownCommand(id))?;
                    match command {
                        CommandId::Stop => return Ok(Some(Command::Stop)),
                        CommandId::Header => return Ok(Some(Command::Header)),
                        CommandId::Start | CommandId::Entry => {
                            self.state = DecodeState::U64Arg(command);
                        }
                        CommandId::Bookmark | CommandId::StartBookmark => {
                            self.state = DecodeState::KeyLen(command);
                        }
                    }
                }
                DecodeState::U64Arg(command) => {
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    let value = src.get_u64();
                    self.state = DecodeState::Head;
                    return Ok(Some(match command {
                        CommandId::Start => Command::Start { from_entry: value },
                        _ => Command::Entry {
                            entry_number: value,
                        },
                    }));
                }
                DecodeState::KeyLen(command) => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let length = src.get_u32();
                    if length > MAX_BOOKMARK_KEY {
                        return Err(ServerError::KeyTooLarge(length));
                    }
                    self.state = DecodeState::KeyBytes(command, length as usize);
                }
                DecodeState::KeyBytes(command, length) => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let key = src.split_to(length).freeze();
                    self.state = DecodeState::Head;
                    return Ok(Some(match command {
                        CommandId::Bookmark => Command::Bookmark { key },
                        _ => Command::StartBookmark { key },
                    }));
                }
            }
        }
    }
}
