//! Relay node.
//!
//! A relay is a stream client of an upstream server wired through a local
//! engine whose server re-serves the identical bytes. On start it asks the
//! upstream for its header, subscribes from its own `total_entries` so a
//! restart resumes where the local file ended, and writes each received
//! entry as a single-entry atomic op. Entry numbers line up because the
//! local counter starts from the same value the subscription does, so
//! downstream clients cannot tell a relay from the origin.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use datastream_client::{ClientError, ClientResult, EntryProcessor, StreamClient};
use datastream_core::{Entry, StreamType};
use datastream_server::{ServerConfig, StreamServer};
use datastream_storage::StreamEngine;

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stream error: {0}")]
    Stream(#[from] datastream_core::Error),

    #[error("server error: {0}")]
    Server(#[from] datastream_server::ServerError),

    #[error("upstream error: {0}")]
    Upstream(#[from] datastream_client::ClientError),
}

/// Writes every upstream entry into the local engine as its own atomic op.
///
/// Bookmark-typed entries go through `add_bookmark` so the local index
/// picks them up; everything else is appended as-is.
struct RelayProcessor {
    engine: Arc<StreamEngine>,
}

#[async_trait]
impl EntryProcessor for RelayProcessor {
    async fn process_entry(&self, entry: Entry) -> ClientResult<()> {
        let engine = &self.engine;
        engine.begin_atomic().await.map_err(ClientError::Stream)?;

        let outcome: Result<(), datastream_core::Error> = async {
            let number = if entry.entry_type.is_bookmark() {
                engine.add_bookmark(entry.payload.clone()).await?
            } else {
                engine
                    .add_entry(entry.entry_type, entry.payload.clone())
                    .await?
            };
            if number != entry.number {
                warn!(
                    received = entry.number,
                    assigned = number,
                    "relay entry number drifted"
                );
            }
            engine.commit_atomic().await
        }
        .await;

        if let Err(e) = outcome {
            let _ = engine.rollback_atomic().await;
            return Err(ClientError::Stream(e));
        }
        debug!(number = entry.number, "entry relayed");
        Ok(())
    }
}

/// A relay that has opened its local file but not yet connected anywhere.
pub struct Relay {
    upstream: String,
    engine: Arc<StreamEngine>,
    config: ServerConfig,
    stream_type: StreamType,
}

impl Relay {
    /// Open (or create) the relay's local stream file.
    pub async fn open(
        upstream: impl Into<String>,
        bind_addr: impl Into<String>,
        stream_type: StreamType,
        file: impl AsRef<Path>,
    ) -> RelayResult<Self> {
        let engine = Arc::new(StreamEngine::open(file, stream_type).await?);
        Ok(Self {
            upstream: upstream.into(),
            engine,
            config: ServerConfig {
                bind_addr: bind_addr.into(),
                ..ServerConfig::default()
            },
            stream_type,
        })
    }

    pub fn engine(&self) -> Arc<StreamEngine> {
        self.engine.clone()
    }

    /// Bring the local server up, then connect upstream and resume the
    /// stream from where the local file ended.
    pub async fn start(self) -> RelayResult<RelayHandle> {
        let server = StreamServer::new(self.engine.clone(), self.config.clone());
        let bound = server.bind().await?;
        let local_addr = bound.local_addr()?;
        let server_task = tokio::spawn(async move {
            if let Err(e) = bound.run().await {
                warn!("relay server stopped: {}", e);
            }
        });

        let processor = Arc::new(RelayProcessor {
            engine: self.engine.clone(),
        });
        let mut upstream =
            StreamClient::connect(self.upstream.clone(), self.stream_type, processor).await?;

        let header = upstream.header().await?;
        let resume_from = self.engine.total_entries().await;
        info!(
            upstream = %self.upstream,
            upstream_total = header.total_entries,
            resume_from,
            "relay syncing"
        );
        upstream.start_from(resume_from).await?;

        Ok(RelayHandle {
            local_addr,
            upstream,
            engine: self.engine,
            server_task,
        })
    }
}

/// A running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    upstream: StreamClient,
    engine: Arc<StreamEngine>,
    server_task: JoinHandle<()>,
}

impl RelayHandle {
    /// Address downstream clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> Arc<StreamEngine> {
        self.engine.clone()
    }

    /// Stop following the upstream and shut the local server down.
    pub async fn stop(mut self) -> RelayResult<()> {
        self.upstream.stop().await?;
        self.server_task.abort();
        Ok(())
    }
}
