//! datastream command-line tool.
//!
//! Three modes:
//! - `server`: runs a stream server plus a demo producer that commits one
//!   block per atomic operation (bookmark, block start, tx, block end).
//! - `client`: queries a server (`--header`, `--entry`, `--bookmark`) or
//!   streams from it (`--from`, `--frombookmark`), optionally checking
//!   sequence consistency with `--sanitycheck`.
//! - `relay`: mirrors an upstream server and re-serves it downstream.
//!
//! ```bash
//! datastream server --port 6900 --file datastream.bin
//! datastream client --server 127.0.0.1:6900 --from 0
//! datastream relay --server 127.0.0.1:6900 --port 7900 --file datarelay.bin
//! ```
//!
//! Logging is controlled by `--log` or the `RUST_LOG` environment variable.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use datastream_client::{ClientResult, EntryProcessor, StreamClient};
use datastream_core::{Entry, EntryType, StreamType};
use datastream_relay::Relay;
use datastream_server::{ServerConfig, StreamServer};
use datastream_storage::StreamEngine;

/// Demo entry types produced by server mode.
const ET_BLOCK_START: EntryType = EntryType(1);
const ET_TX: EntryType = EntryType(2);
const ET_BLOCK_END: EntryType = EntryType(3);

/// Entries per demo atomic operation (bookmark, start, tx, end). Used to
/// derive the next block number from the entry count after a restart.
const ENTRIES_PER_BLOCK: u64 = 4;

#[derive(Parser)]
#[command(name = "datastream", about = "Run a datastream server, client, or relay")]
struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stream server with a demo producer
    Server(ServerArgs),
    /// Run a stream client
    Client(ClientArgs),
    /// Run a stream relay
    Relay(RelayArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Exposed port for clients to connect
    #[arg(long, default_value_t = 6900)]
    port: u16,

    /// Stream data file name (*.bin)
    #[arg(long, default_value = "datastream.bin")]
    file: String,

    /// Initial sleep and sleep between atomic operations, in milliseconds
    #[arg(long, default_value_t = 0)]
    sleep: u64,

    /// Number of atomic operations (the server terminates after them)
    #[arg(long, default_value_t = 1_000_000)]
    opers: u64,
}

#[derive(Args)]
struct ClientArgs {
    /// Server address to connect to (IP:port)
    #[arg(long, default_value = "127.0.0.1:6900")]
    server: String,

    /// Entry number to start streaming from (latest|0..N)
    #[arg(long, default_value = "latest")]
    from: String,

    /// Block number bookmark to start streaming from (overrides --from)
    #[arg(long)]
    frombookmark: Option<u64>,

    /// Query the file header and exit
    #[arg(long)]
    header: bool,

    /// Query a single entry number and exit
    #[arg(long)]
    entry: Option<u64>,

    /// Query the entry a block number bookmark points at and exit
    #[arg(long)]
    bookmark: Option<u64>,

    /// Check entry and block sequence consistency while streaming
    #[arg(long)]
    sanitycheck: bool,
}

#[derive(Args)]
struct RelayArgs {
    /// Upstream server address to connect to (IP:port)
    #[arg(long, default_value = "127.0.0.1:6900")]
    server: String,

    /// Exposed port for downstream clients to connect
    #[arg(long, default_value_t = 7900)]
    port: u16,

    /// Relay data file name (*.bin)
    #[arg(long, default_value = "datarelay.bin")]
    file: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Client(args) => run_client(args).await,
        Commands::Relay(args) => run_relay(args).await,
    }
}

// ---------------------------------------------------------------
// server mode
// ---------------------------------------------------------------

async fn run_server(args: ServerArgs) -> Result<()> {
    let engine = Arc::new(
        StreamEngine::open(&args.file, StreamType::Sequencer)
            .await
            .with_context(|| format!("opening stream file {}", args.file))?,
    );

    let server = StreamServer::new(
        engine.clone(),
        ServerConfig {
            bind_addr: format!("0.0.0.0:{}", args.port),
            ..ServerConfig::default()
        },
    );
    let bound = server.bind().await?;
    tokio::spawn(async move {
        if let Err(e) = bound.run().await {
            warn!("server stopped: {}", e);
        }
    });

    tokio::time::sleep(Duration::from_millis(args.sleep)).await;

    // Continue block numbering where a previous run left off.
    let mut block = engine.total_entries().await / ENTRIES_PER_BLOCK;

    for _ in 0..args.opers {
        engine.begin_atomic().await?;

        let outcome: datastream_core::Result<()> = async {
            engine.add_bookmark(bookmark_key(block)).await?;
            engine.add_entry(ET_BLOCK_START, block_start_payload(block)).await?;
            engine.add_entry(ET_TX, tx_payload()).await?;
            engine.add_entry(ET_BLOCK_END, block_end_payload(block)).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => engine.commit_atomic().await?,
            Err(e) => {
                warn!(block, "atomic operation failed, rolling back: {}", e);
                engine.rollback_atomic().await?;
                break;
            }
        }

        block += 1;
        if args.sleep > 0 {
            tokio::time::sleep(Duration::from_millis(args.sleep)).await;
        }
    }

    info!(blocks = block, "server done");
    Ok(())
}

/// Bookmark key for a block: a zero prefix byte plus the block number.
fn bookmark_key(block: u64) -> Bytes {
    let mut key = Vec::with_capacity(9);
    key.push(0);
    key.extend_from_slice(&block.to_le_bytes());
    Bytes::from(key)
}

fn block_start_payload(block: u64) -> Bytes {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let mut data = Vec::with_capacity(76);
    data.extend_from_slice(&101u64.to_le_bytes());
    data.extend_from_slice(&block.to_le_bytes());
    data.extend_from_slice(&timestamp.to_le_bytes());
    data.extend_from_slice(&[0u8; 52]);
    Bytes::from(data)
}

fn tx_payload() -> Bytes {
    let mut rng = rand::thread_rng();
    let body: [u8; 16] = rng.gen();
    let mut data = Vec::with_capacity(22);
    data.push(128);
    data.push(1);
    data.extend_from_slice(&(body.len() as u32).to_le_bytes());
    data.extend_from_slice(&body);
    Bytes::from(data)
}

fn block_end_payload(block: u64) -> Bytes {
    let mut data = Vec::with_capacity(72);
    data.extend_from_slice(&block.to_le_bytes());
    data.extend_from_slice(&[0u8; 64]);
    Bytes::from(data)
}

// ---------------------------------------------------------------
// client mode
// ---------------------------------------------------------------

/// Logs basic data of every streamed entry.
struct PrintEntry;

#[async_trait]
impl EntryProcessor for PrintEntry {
    async fn process_entry(&self, entry: Entry) -> ClientResult<()> {
        info!(
            "entry {} | length {} | type {} | {} payload bytes",
            entry.number,
            entry.frame_len(),
            entry.entry_type.as_u32(),
            entry.payload.len()
        );
        Ok(())
    }
}

#[derive(Default)]
struct SanityState {
    next_entry: Option<u64>,
    next_block: Option<u64>,
    next_bookmark: Option<u64>,
}

/// Checks entry, block, and bookmark sequence consistency while streaming.
struct SanityCheck {
    state: Mutex<SanityState>,
}

impl SanityCheck {
    /// `from_entry` is None when the starting point is only known to the
    /// server (latest, or a bookmark); the first received entry seeds the
    /// sequence then.
    fn new(from_entry: Option<u64>) -> Self {
        Self {
            state: Mutex::new(SanityState {
                next_entry: from_entry,
                next_block: None,
                next_bookmark: None,
            }),
        }
    }
}

#[async_trait]
impl EntryProcessor for SanityCheck {
    async fn process_entry(&self, entry: Entry) -> ClientResult<()> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if entry.number % 100_000 == 0 {
            info!("checking entry {}...", entry.number);
        }

        if let Some(expected) = state.next_entry {
            if entry.number != expected {
                if entry.number < expected {
                    warn!(
                        "sanity check failed: repeated entries? received {} expected {}",
                        entry.number, expected
                    );
                } else {
                    warn!(
                        "sanity check failed: entry gap? received {} expected {}",
                        entry.number, expected
                    );
                }
            }
        }
        state.next_entry = Some(entry.number + 1);

        if entry.entry_type == ET_BLOCK_START && entry.payload.len() >= 16 {
            let block = u64::from_le_bytes([
                entry.payload[8],
                entry.payload[9],
                entry.payload[10],
                entry.payload[11],
                entry.payload[12],
                entry.payload[13],
                entry.payload[14],
                entry.payload[15],
            ]);
            if let Some(expected) = state.next_block {
                if block != expected {
                    warn!(
                        "sanity check failed: block gap? received {} expected {}",
                        block, expected
                    );
                }
            }
            state.next_block = Some(block + 1);
        }

        if entry.entry_type.is_bookmark() && entry.payload.len() >= 9 {
            let bookmark = u64::from_le_bytes([
                entry.payload[1],
                entry.payload[2],
                entry.payload[3],
                entry.payload[4],
                entry.payload[5],
                entry.payload[6],
                entry.payload[7],
                entry.payload[8],
            ]);
            if let Some(expected) = state.next_bookmark {
                if bookmark != expected {
                    warn!(
                        "sanity check failed: bookmark gap? received {} expected {}",
                        bookmark, expected
                    );
                }
            }
            state.next_bookmark = Some(bookmark + 1);
        }

        Ok(())
    }
}

async fn run_client(args: ClientArgs) -> Result<()> {
    // Resolve the starting entry up front so the sanity checker knows it.
    let from_hint = match (args.frombookmark, args.from.as_str()) {
        (Some(_), _) | (None, "latest") => None,
        (None, from) => Some(
            from.parse::<u64>()
                .context("--from must be latest or an entry number")?,
        ),
    };

    let processor: Arc<dyn EntryProcessor> = if args.sanitycheck {
        Arc::new(SanityCheck::new(from_hint))
    } else {
        Arc::new(PrintEntry)
    };
    let mut client =
        StreamClient::connect(args.server.clone(), StreamType::Sequencer, processor).await?;

    if args.header {
        let header = client.header().await?;
        info!(
            "header: total entries {} | total length {}",
            header.total_entries, header.total_length
        );
        return Ok(());
    }

    if let Some(number) = args.entry {
        let entry = client.entry(number).await?;
        info!(
            "entry {}: length {} | type {} | {:02x?}",
            entry.number,
            entry.frame_len(),
            entry.entry_type.as_u32(),
            &entry.payload[..entry.payload.len().min(32)]
        );
        return Ok(());
    }

    if let Some(block) = args.bookmark {
        let entry = client.bookmark(&bookmark_key(block)).await?;
        info!(
            "bookmark {}: entry {} | length {} | type {}",
            block,
            entry.number,
            entry.frame_len(),
            entry.entry_type.as_u32()
        );
        return Ok(());
    }

    let header = client.header().await?;
    if let Some(block) = args.frombookmark {
        client.start_from_bookmark(&bookmark_key(block)).await?;
    } else {
        match from_hint {
            Some(from) => client.start_from(from).await?,
            None => client.start_from(header.total_entries).await?,
        }
    }

    // Stream until interrupted.
    signal::ctrl_c().await?;
    client.stop().await?;
    info!("client stopped");
    Ok(())
}

// ---------------------------------------------------------------
// relay mode
// ---------------------------------------------------------------

async fn run_relay(args: RelayArgs) -> Result<()> {
    let relay = Relay::open(
        args.server,
        format!("0.0.0.0:{}", args.port),
        StreamType::Sequencer,
        &args.file,
    )
    .await
    .with_context(|| format!("opening relay file {}", args.file))?;

    let relay = relay.start().await?;
    info!("relay serving on {}", relay.local_addr());

    signal::ctrl_c().await?;
    relay.stop().await?;
    info!("relay stopped");
    Ok(())
}
