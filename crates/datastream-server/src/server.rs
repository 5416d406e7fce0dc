//! TCP stream server.
//!
//! One accept loop, and per accepted connection a reader task and a sender
//! task joined by a bounded packet queue. The reader parses commands and
//! answers each with exactly one Result packet, queued ahead of whatever
//! payload the command produces, so the wire ordering guarantee falls out
//! of the queue's FIFO order.
//!
//! Streaming is pull-based. When a client subscribes, its sender task
//! reads committed frames straight from the file through its own read
//! handle and follows the engine's commit watermark; the engine itself
//! never writes to a socket and never waits for one. A client that stops
//! draining its queue is killed rather than allowed to push back into the
//! engine.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

use datastream_core::{Error as StreamError, ResultPacket};
use datastream_storage::{StoreReader, StreamEngine};

use crate::codec::{Command, CommandDecoder};
use crate::error::{ServerError, ServerResult};
use crate::hub::{ConnId, StreamHub};

/// Stream server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Packets queued per connection before the client is dropped as slow.
    pub packet_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:6900".to_string(),
            packet_queue: 64,
        }
    }
}

/// Shared state for all connections.
struct ServerState {
    engine: Arc<StreamEngine>,
    hub: StreamHub,
    config: ServerConfig,
}

/// TCP server over one stream engine.
pub struct StreamServer {
    state: Arc<ServerState>,
}

impl StreamServer {
    pub fn new(engine: Arc<StreamEngine>, config: ServerConfig) -> Self {
        let hub = StreamHub::new(engine.subscribe_commits());
        Self {
            state: Arc::new(ServerState {
                engine,
                hub,
                config,
            }),
        }
    }

    /// Bind the listener without accepting yet, so callers can learn the
    /// actual port before starting the accept loop.
    pub async fn bind(self) -> ServerResult<BoundStreamServer> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("stream server listening on {}", local_addr);
        Ok(BoundStreamServer {
            listener,
            state: self.state,
        })
    }

    /// Run the server until the shutdown signal fires.
    pub async fn run_until(self, shutdown: oneshot::Receiver<()>) -> ServerResult<()> {
        self.bind().await?.run_until(shutdown).await
    }
}

/// A stream server bound to a port.
pub struct BoundStreamServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl BoundStreamServer {
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        self.listener.local_addr().map_err(ServerError::from)
    }

    /// Accept connections forever.
    pub async fn run(self) -> ServerResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => spawn_connection(stream, addr, self.state.clone()),
                Err(e) => error!("failed to accept connection: {}", e),
            }
        }
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run_until(self, shutdown: oneshot::Receiver<()>) -> ServerResult<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => spawn_connection(stream, addr, self.state.clone()),
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("stream server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

fn spawn_connection(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, addr, state).await {
            match e {
                ServerError::ConnectionClosed | ServerError::Io(_) => {
                    debug!("connection closed: {} ({})", addr, e);
                }
                _ => warn!("connection error from {}: {}", addr, e),
            }
        }
    });
}

/// Events the reader queues for the sender task. The queue is bounded;
/// FIFO order is what makes a Result precede its payload on the wire.
enum ConnEvent {
    /// Pre-encoded packet to write as-is.
    Packet(Bytes),
    /// Enter streaming mode at the given entry number.
    StartStream { from: u64 },
    /// Leave streaming mode.
    StopStream,
}

#[instrument(skip(stream, state), fields(client = %addr))]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> ServerResult<()> {
    debug!("new connection");
    let conn_id = state.hub.register().await;

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(state.config.packet_queue);

    let sender_state = state.clone();
    let sender = tokio::spawn(async move {
        if let Err(e) = sender_loop(write_half, rx, conn_id, sender_state).await {
            debug!(conn = conn_id, "sender stopped: {}", e);
        }
    });

    let result = read_loop(read_half, conn_id, &state, &tx).await;

    drop(tx);
    state.hub.drop_client(conn_id).await;
    let _ = sender.await;
    result
}

async fn read_loop(
    read_half: OwnedReadHalf,
    conn_id: ConnId,
    state: &Arc<ServerState>,
    tx: &mpsc::Sender<ConnEvent>,
) -> ServerResult<()> {
    let mut commands = FramedRead::new(
        read_half,
        CommandDecoder::new(state.engine.stream_type()),
    );

    while let Some(next) = commands.next().await {
        let command = match next {
            Ok(command) => command,
            // Protocol violations are fatal and get no Result.
            Err(e) => {
                warn!(conn = conn_id, "protocol violation: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = process_command(command, conn_id, state, tx).await {
            if matches!(e, ServerError::Overloaded) {
                state.hub.kill(conn_id).await;
                warn!(conn = conn_id, "dropping slow client");
            }
            return Err(e);
        }
    }

    debug!(conn = conn_id, "client closed connection");
    Ok(())
}

/// Handle one command: check its precondition, queue exactly one Result,
/// then queue the payload or subscription change on success.
async fn process_command(
    command: Command,
    conn_id: ConnId,
    state: &Arc<ServerState>,
    tx: &mpsc::Sender<ConnEvent>,
) -> ServerResult<()> {
    debug!(conn = conn_id, ?command, "command received");

    match command {
        Command::Header => match state.hub.require_stopped(conn_id).await {
            Ok(()) => {
                let header = state.engine.header().await;
                enqueue(tx, ConnEvent::Packet(ResultPacket::ok().encode()))?;
                enqueue(tx, ConnEvent::Packet(header.encode()))?;
            }
            Err(e) => send_failure(conn_id, tx, &e)?,
        },

        Command::Entry { entry_number } => {
            let outcome = match state.hub.require_stopped(conn_id).await {
                Ok(()) => state.engine.read_entry(entry_number).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(entry) => {
                    enqueue(tx, ConnEvent::Packet(ResultPacket::ok().encode()))?;
                    enqueue(tx, ConnEvent::Packet(entry.encode()))?;
                }
                Err(e) => send_failure(conn_id, tx, &e)?,
            }
        }

        Command::Bookmark { key } => {
            let outcome = match state.hub.require_stopped(conn_id).await {
                Ok(()) => state.engine.bookmark_entry(&key).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(entry) => {
                    enqueue(tx, ConnEvent::Packet(ResultPacket::ok().encode()))?;
                    enqueue(tx, ConnEvent::Packet(entry.encode()))?;
                }
                Err(e) => send_failure(conn_id, tx, &e)?,
            }
        }

        Command::Start { from_entry } => match state.hub.subscribe(conn_id, from_entry).await {
            Ok(()) => {
                enqueue(tx, ConnEvent::Packet(ResultPacket::ok().encode()))?;
                enqueue(tx, ConnEvent::StartStream { from: from_entry })?;
            }
            Err(e) => send_failure(conn_id, tx, &e)?,
        },

        Command::StartBookmark { key } => {
            let outcome = async {
                state.hub.require_stopped(conn_id).await?;
                let from = state.engine.bookmark(&key).await?;
                state.hub.subscribe(conn_id, from).await?;
                Ok::<u64, StreamError>(from)
            }
            .await;
            match outcome {
                Ok(from) => {
                    enqueue(tx, ConnEvent::Packet(ResultPacket::ok().encode()))?;
                    enqueue(tx, ConnEvent::StartStream { from })?;
                }
                Err(e) => send_failure(conn_id, tx, &e)?,
            }
        }

        Command::Stop => match state.hub.unsubscribe(conn_id).await {
            Ok(()) => {
                enqueue(tx, ConnEvent::Packet(ResultPacket::ok().encode()))?;
                enqueue(tx, ConnEvent::StopStream)?;
            }
            Err(e) => send_failure(conn_id, tx, &e)?,
        },
    }

    Ok(())
}

fn send_failure(
    conn_id: ConnId,
    tx: &mpsc::Sender<ConnEvent>,
    error: &StreamError,
) -> ServerResult<()> {
    debug!(conn = conn_id, "command failed: {}", error);
    enqueue(tx, ConnEvent::Packet(ResultPacket::failure(error).encode()))
}

fn enqueue(tx: &mpsc::Sender<ConnEvent>, event: ConnEvent) -> ServerResult<()> {
    match tx.try_send(event) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(ServerError::Overloaded),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(ServerError::ConnectionClosed),
    }
}

/// Owns the socket's write half. Writes queued packets, and while the
/// connection is subscribed, ships committed entries in number order from
/// its own file read handle, waking on the engine's commit watermark.
async fn sender_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ConnEvent>,
    conn_id: ConnId,
    state: Arc<ServerState>,
) -> ServerResult<()> {
    let mut commits = state.engine.subscribe_commits();
    let mut reader: Option<StoreReader> = None;
    let mut cursor: Option<u64> = None;

    loop {
        if let Some(position) = cursor {
            let watermark = *commits.borrow_and_update();
            if position < watermark {
                if reader.is_none() {
                    reader = Some(state.engine.new_reader().await?);
                }
                if let Some(store_reader) = reader.as_mut() {
                    let location = state.engine.entry_location(position).await?;
                    let frame = store_reader.read_frame(location).await?;
                    writer.write_all(&frame).await?;
                }
                cursor = Some(position + 1);
                state.hub.set_cursor(conn_id, position + 1).await;

                // Let control events cut in between frames so a Stop takes
                // effect promptly even mid-backlog.
                while let Ok(event) = rx.try_recv() {
                    apply_event(event, &mut writer, &mut cursor, &mut reader, &state).await?;
                }
                continue;
            }

            // Caught up; sleep until a commit lands or the reader queues
            // something.
            tokio::select! {
                changed = commits.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        apply_event(event, &mut writer, &mut cursor, &mut reader, &state).await?;
                    }
                    None => return Ok(()),
                },
            }
        } else {
            match rx.recv().await {
                Some(event) => {
                    apply_event(event, &mut writer, &mut cursor, &mut reader, &state).await?;
                }
                None => return Ok(()),
            }
        }
    }
}

async fn apply_event(
    event: ConnEvent,
    writer: &mut OwnedWriteHalf,
    cursor: &mut Option<u64>,
    reader: &mut Option<StoreReader>,
    state: &Arc<ServerState>,
) -> ServerResult<()> {
    match event {
        ConnEvent::Packet(bytes) => writer.write_all(&bytes).await?,
        ConnEvent::StartStream { from } => {
            if reader.is_none() {
                *reader = Some(state.engine.new_reader().await?);
            }
            *cursor = Some(from);
        }
        ConnEvent::StopStream => *cursor = None,
    }
    Ok(())
}
