//! Stream client.
//!
//! One reader task demultiplexes everything the server sends by the
//! leading packet tag into three bounded queues (results, headers,
//! entries); a dispatch task drains the entries queue into the
//! user-supplied [`EntryProcessor`]. Command methods write the raw
//! big-endian command framing, then block on the results queue for the one
//! Result the server owes them, then on the follow-up packet when the
//! command has one.
//!
//! Single-entry replies (`Entry`, `Bookmark`) arrive on the same entries
//! queue as streamed data; since those commands are only legal while
//! stopped, the pending query slot routes the next data packet to the
//! caller instead of the processor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use datastream_core::types::{
    ENTRY_FIXED_SIZE, HEADER_SIZE, PT_DATA, PT_HEADER, PT_RESULT, RESULT_FIXED_SIZE,
};
use datastream_core::{CommandId, Entry, EntryType, Header, ResultPacket, StreamType};

use crate::error::{ClientError, ClientResult};

const RESULTS_BUFFER: usize = 32;
const HEADERS_BUFFER: usize = 32;
const ENTRIES_BUFFER: usize = 128;

/// Callback invoked for every streamed entry, in entry-number order.
#[async_trait]
pub trait EntryProcessor: Send + Sync {
    async fn process_entry(&self, entry: Entry) -> ClientResult<()>;
}

/// Processor that drops streamed entries, for query-only clients.
pub struct DiscardEntries;

#[async_trait]
impl EntryProcessor for DiscardEntries {
    async fn process_entry(&self, _entry: Entry) -> ClientResult<()> {
        Ok(())
    }
}

type QuerySlot = Arc<Mutex<Option<oneshot::Sender<Entry>>>>;

/// TCP client for one stream server.
pub struct StreamClient {
    server: String,
    stream_type: StreamType,
    writer: OwnedWriteHalf,
    results: mpsc::Receiver<ResultPacket>,
    headers: mpsc::Receiver<Header>,
    query_slot: QuerySlot,
    header: Option<Header>,

    /// Entry number `start` subscribes from.
    pub from_entry: u64,
    /// When set, `start` subscribes from this bookmark instead.
    pub from_bookmark: Option<Bytes>,
}

impl StreamClient {
    /// Connect and spawn the reader and dispatch tasks. Streamed entries
    /// are handed to `processor` in order until disconnect.
    pub async fn connect(
        server: impl Into<String>,
        stream_type: StreamType,
        processor: Arc<dyn EntryProcessor>,
    ) -> ClientResult<Self> {
        let server = server.into();
        let stream = TcpStream::connect(&server)
            .await
            .map_err(|source| ClientError::Connect {
                server: server.clone(),
                source,
            })?;
        let (read_half, writer) = stream.into_split();
        info!(server = %server, "connected to stream server");

        let (results_tx, results) = mpsc::channel(RESULTS_BUFFER);
        let (headers_tx, headers) = mpsc::channel(HEADERS_BUFFER);
        let (entries_tx, entries_rx) = mpsc::channel(ENTRIES_BUFFER);
        let query_slot: QuerySlot = Arc::new(Mutex::new(None));

        tokio::spawn(read_loop(read_half, results_tx, headers_tx, entries_tx));
        tokio::spawn(dispatch_loop(entries_rx, query_slot.clone(), processor));

        Ok(Self {
            server,
            stream_type,
            writer,
            results,
            headers,
            query_slot,
            header: None,
            from_entry: 0,
            from_bookmark: None,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Header received by the most recent `header` call.
    pub fn last_header(&self) -> Option<Header> {
        self.header
    }

    /// Ask the server for its header snapshot.
    pub async fn header(&mut self) -> ClientResult<Header> {
        self.send_head(CommandId::Header).await?;
        self.await_result(CommandId::Header).await?;
        let header = self
            .headers
            .recv()
            .await
            .ok_or(ClientError::ConnectionClosed)?;
        debug!(
            total_entries = header.total_entries,
            total_length = header.total_length,
            "header received"
        );
        self.header = Some(header);
        Ok(header)
    }

    /// Subscribe using the configured `from_bookmark` or `from_entry`.
    pub async fn start(&mut self) -> ClientResult<()> {
        match self.from_bookmark.clone() {
            Some(key) => self.start_from_bookmark(&key).await,
            None => self.start_from(self.from_entry).await,
        }
    }

    /// Subscribe from a specific entry number.
    pub async fn start_from(&mut self, from_entry: u64) -> ClientResult<()> {
        debug!(from_entry, "starting stream");
        let mut buf = self.command_head(CommandId::Start);
        buf.put_u64(from_entry);
        self.writer.write_all(&buf).await?;
        self.await_result(CommandId::Start).await
    }

    /// Fetch the header and subscribe from its `total_entries`, so only
    /// entries committed after this call arrive.
    pub async fn start_from_latest(&mut self) -> ClientResult<()> {
        let header = self.header().await?;
        self.start_from(header.total_entries).await
    }

    /// Subscribe from the entry a bookmark points at.
    pub async fn start_from_bookmark(&mut self, key: &[u8]) -> ClientResult<()> {
        debug!(key = ?key, "starting stream from bookmark");
        let mut buf = self.command_head(CommandId::StartBookmark);
        buf.put_u32(key.len() as u32);
        buf.extend_from_slice(key);
        self.writer.write_all(&buf).await?;
        self.await_result(CommandId::StartBookmark).await
    }

    /// Stop streaming.
    pub async fn stop(&mut self) -> ClientResult<()> {
        self.send_head(CommandId::Stop).await?;
        self.await_result(CommandId::Stop).await
    }

    /// Fetch one entry by number. Only legal while stopped.
    pub async fn entry(&mut self, entry_number: u64) -> ClientResult<Entry> {
        let rx = self.arm_query().await;
        let mut buf = self.command_head(CommandId::Entry);
        buf.put_u64(entry_number);
        self.writer.write_all(&buf).await?;
        if let Err(e) = self.await_result(CommandId::Entry).await {
            self.query_slot.lock().await.take();
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Fetch the entry a bookmark points at. Only legal while stopped.
    pub async fn bookmark(&mut self, key: &[u8]) -> ClientResult<Entry> {
        let rx = self.arm_query().await;
        let mut buf = self.command_head(CommandId::Bookmark);
        buf.put_u32(key.len() as u32);
        buf.extend_from_slice(key);
        self.writer.write_all(&buf).await?;
        if let Err(e) = self.await_result(CommandId::Bookmark).await {
            self.query_slot.lock().await.take();
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    fn command_head(&self, command: CommandId) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u64(command.as_u64());
        buf.put_u64(self.stream_type.as_u64());
        buf
    }

    async fn send_head(&mut self, command: CommandId) -> ClientResult<()> {
        let buf = self.command_head(command);
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    /// Park a oneshot in the query slot before the command goes out, so
    /// the reply cannot race past it.
    async fn arm_query(&self) -> oneshot::Receiver<Entry> {
        let (tx, rx) = oneshot::channel();
        *self.query_slot.lock().await = Some(tx);
        rx
    }

    async fn await_result(&mut self, command: CommandId) -> ClientResult<()> {
        let result = self
            .results
            .recv()
            .await
            .ok_or(ClientError::ConnectionClosed)?;
        debug!(
            ?command,
            code = result.error_num,
            text = %result.error_str,
            "result received"
        );
        if result.is_ok() {
            Ok(())
        } else {
            Err(ClientError::Command {
                code: result.error_num,
                message: result.error_str,
            })
        }
    }
}

enum Packet {
    Result(ResultPacket),
    Header(Header),
    Entry(Entry),
}

/// Read packets off the socket and route them by tag. Dropping the queue
/// senders on exit is how consumers observe end-of-stream.
async fn read_loop(
    mut reader: OwnedReadHalf,
    results: mpsc::Sender<ResultPacket>,
    headers: mpsc::Sender<Header>,
    entries: mpsc::Sender<Entry>,
) {
    loop {
        let mut tag = [0u8; 1];
        match reader.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("server closed connection");
                break;
            }
            Err(e) => {
                warn!("read error: {}", e);
                break;
            }
        }

        let packet = match tag[0] {
            PT_RESULT => read_result(&mut reader).await.map(Packet::Result),
            PT_HEADER => read_header(&mut reader).await.map(Packet::Header),
            PT_DATA => read_entry(&mut reader).await.map(Packet::Entry),
            other => Err(ClientError::Protocol(format!(
                "unknown packet tag 0x{:02x}",
                other
            ))),
        };

        match packet {
            Ok(Packet::Result(r)) => {
                if results.send(r).await.is_err() {
                    break;
                }
            }
            Ok(Packet::Header(h)) => {
                if headers.send(h).await.is_err() {
                    break;
                }
            }
            Ok(Packet::Entry(e)) => {
                if entries.send(e).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("stream read failed: {}", e);
                break;
            }
        }
    }
}

async fn read_result(reader: &mut OwnedReadHalf) -> ClientResult<ResultPacket> {
    let mut fixed = [0u8; RESULT_FIXED_SIZE - 1];
    reader.read_exact(&mut fixed).await?;
    let length = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as usize;
    if length < RESULT_FIXED_SIZE {
        return Err(ClientError::Protocol(format!(
            "result length {} too small",
            length
        )));
    }
    let mut rest = vec![0u8; length - RESULT_FIXED_SIZE];
    reader.read_exact(&mut rest).await?;

    let mut frame = BytesMut::with_capacity(length);
    frame.put_u8(PT_RESULT);
    frame.extend_from_slice(&fixed);
    frame.extend_from_slice(&rest);
    ResultPacket::decode(&frame).map_err(Into::into)
}

async fn read_header(reader: &mut OwnedReadHalf) -> ClientResult<Header> {
    let mut rest = [0u8; HEADER_SIZE - 1];
    reader.read_exact(&mut rest).await?;

    let mut frame = BytesMut::with_capacity(HEADER_SIZE);
    frame.put_u8(PT_HEADER);
    frame.extend_from_slice(&rest);
    Header::decode(&frame).map_err(Into::into)
}

async fn read_entry(reader: &mut OwnedReadHalf) -> ClientResult<Entry> {
    let mut fixed = [0u8; 16];
    reader.read_exact(&mut fixed).await?;
    let length = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as usize;
    if length < ENTRY_FIXED_SIZE {
        return Err(ClientError::Protocol(format!(
            "entry length {} too small",
            length
        )));
    }
    let mut payload = vec![0u8; length - ENTRY_FIXED_SIZE];
    reader.read_exact(&mut payload).await?;

    let entry_type = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let number = u64::from_be_bytes([
        fixed[8], fixed[9], fixed[10], fixed[11], fixed[12], fixed[13], fixed[14], fixed[15],
    ]);
    Ok(Entry::new(
        EntryType(entry_type),
        number,
        Bytes::from(payload),
    ))
}

/// Drain the entries queue: a parked single-entry query takes the next
/// data packet, everything else goes to the processor.
async fn dispatch_loop(
    mut entries: mpsc::Receiver<Entry>,
    query_slot: QuerySlot,
    processor: Arc<dyn EntryProcessor>,
) {
    while let Some(entry) = entries.recv().await {
        let pending = query_slot.lock().await.take();
        if let Some(slot) = pending {
            let _ = slot.send(entry);
            continue;
        }
        let number = entry.number;
        if let Err(e) = processor.process_entry(entry).await {
            warn!(number, "entry processor failed: {}", e);
        }
    }
    debug!("entry stream ended");
}
