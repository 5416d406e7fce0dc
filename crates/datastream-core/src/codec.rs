//! Binary encoding of the three packet kinds.
//!
//! All multi-byte integers are big-endian, on the wire and in the file, so
//! an entry frame read from disk can be written to a socket unchanged.
//!
//! Frame layouts:
//!
//! ```text
//! Header (29 bytes):
//! +-----+-------------+----------------+------------------+-------------------+
//! | tag | length (u32)| stream type    | total length     | total entries     |
//! | 0x01| always 29   | (u64)          | (u64)            | (u64)             |
//! +-----+-------------+----------------+------------------+-------------------+
//!
//! Entry (17 + N bytes):
//! +-----+-------------+------------+--------------+---------------+
//! | tag | length (u32)| type (u32) | number (u64) | payload (N)   |
//! | 0x02| 17 + N      |            |              |               |
//! +-----+-------------+------------+--------------+---------------+
//!
//! Result (9 + N bytes):
//! +-----+-------------+----------------+------------------+
//! | tag | length (u32)| error num (u32)| error str (N)    |
//! | 0xff| 9 + N       | 0 means OK     | UTF-8            |
//! +-----+-------------+----------------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{
    EntryType, StreamType, ENTRY_FIXED_SIZE, HEADER_SIZE, PT_DATA, PT_HEADER, PT_RESULT,
    RESULT_FIXED_SIZE,
};

/// Stream file header, also sent verbatim as the Header packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub stream_type: StreamType,
    /// Total bytes in the file, header included.
    pub total_length: u64,
    /// Count of committed entries.
    pub total_entries: u64,
}

impl Header {
    /// Header of a freshly created, empty stream file.
    pub fn new(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            total_length: HEADER_SIZE as u64,
            total_entries: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u8(PT_HEADER);
        buf.put_u32(HEADER_SIZE as u32);
        buf.put_u64(self.stream_type.as_u64());
        buf.put_u64(self.total_length);
        buf.put_u64(self.total_entries);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Malformed(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        let mut buf = &buf[..HEADER_SIZE];
        let tag = buf.get_u8();
        if tag != PT_HEADER {
            return Err(Error::Malformed(format!("bad header tag 0x{:02x}", tag)));
        }
        let length = buf.get_u32();
        if length as usize != HEADER_SIZE {
            return Err(Error::Malformed(format!("bad header length {}", length)));
        }
        let raw_stream_type = buf.get_u64();
        let stream_type = StreamType::from_u64(raw_stream_type).ok_or_else(|| {
            Error::Incompatible(format!("unknown stream type {}", raw_stream_type))
        })?;
        let total_length = buf.get_u64();
        let total_entries = buf.get_u64();
        Ok(Self {
            stream_type,
            total_length,
            total_entries,
        })
    }
}

/// A numbered, typed, opaque-payload log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub number: u64,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(entry_type: EntryType, number: u64, payload: Bytes) -> Self {
        Self {
            entry_type,
            number,
            payload,
        }
    }

    /// Total frame size of this entry, framing included.
    pub fn frame_len(&self) -> u32 {
        (ENTRY_FIXED_SIZE + self.payload.len()) as u32
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_FIXED_SIZE + self.payload.len());
        buf.put_u8(PT_DATA);
        buf.put_u32(self.frame_len());
        buf.put_u32(self.entry_type.as_u32());
        buf.put_u64(self.number);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENTRY_FIXED_SIZE {
            return Err(Error::Malformed(format!(
                "entry needs at least {} bytes, got {}",
                ENTRY_FIXED_SIZE,
                buf.len()
            )));
        }
        let mut head = &buf[..ENTRY_FIXED_SIZE];
        let tag = head.get_u8();
        if tag != PT_DATA {
            return Err(Error::Malformed(format!("bad entry tag 0x{:02x}", tag)));
        }
        let length = head.get_u32() as usize;
        if length < ENTRY_FIXED_SIZE {
            return Err(Error::Malformed(format!("entry length {} too small", length)));
        }
        if buf.len() < length {
            return Err(Error::Malformed(format!(
                "entry length {} exceeds available {}",
                length,
                buf.len()
            )));
        }
        let entry_type = EntryType(head.get_u32());
        let number = head.get_u64();
        let payload = Bytes::copy_from_slice(&buf[ENTRY_FIXED_SIZE..length]);
        Ok(Self {
            entry_type,
            number,
            payload,
        })
    }
}

/// Reply to a command. `error_num` 0 means OK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPacket {
    pub error_num: u32,
    pub error_str: String,
}

impl ResultPacket {
    pub fn ok() -> Self {
        Self {
            error_num: 0,
            error_str: "OK".to_string(),
        }
    }

    pub fn failure(error: &Error) -> Self {
        Self {
            error_num: error.code(),
            error_str: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_num == 0
    }

    pub fn encode(&self) -> Bytes {
        let text = self.error_str.as_bytes();
        let mut buf = BytesMut::with_capacity(RESULT_FIXED_SIZE + text.len());
        buf.put_u8(PT_RESULT);
        buf.put_u32((RESULT_FIXED_SIZE + text.len()) as u32);
        buf.put_u32(self.error_num);
        buf.extend_from_slice(text);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RESULT_FIXED_SIZE {
            return Err(Error::Malformed(format!(
                "result needs at least {} bytes, got {}",
                RESULT_FIXED_SIZE,
                buf.len()
            )));
        }
        let mut head = &buf[..RESULT_FIXED_SIZE];
        let tag = head.get_u8();
        if tag != PT_RESULT {
            return Err(Error::Malformed(format!("bad result tag 0x{:02x}", tag)));
        }
        let length = head.get_u32() as usize;
        if length < RESULT_FIXED_SIZE {
            return Err(Error::Malformed(format!("result length {} too small", length)));
        }
        if buf.len() < length {
            return Err(Error::Malformed(format!(
                "result length {} exceeds available {}",
                length,
                buf.len()
            )));
        }
        let error_num = head.get_u32();
        let error_str = String::from_utf8(buf[RESULT_FIXED_SIZE..length].to_vec())
            .map_err(|e| Error::Malformed(format!("result text is not UTF-8: {}", e)))?;
        Ok(Self {
            error_num,
            error_str,
        })
    }
}
