//! Per-client subscription registry and commit fan-out.
//!
//! The hub owns the subscription state of every accepted connection:
//! whether it is streaming, where its cursor sits, and whether it was
//! killed for falling behind. Committed entries are announced through the
//! engine's watch watermark, which the hub hands to each connection's
//! sender task; delivery itself is pull-based, so one slow client never
//! holds entry bytes hostage for the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{watch, Mutex};
use tracing::debug;

use datastream_core::{Error, Result};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Stopped,
    Streaming,
    Killed,
}

/// Subscription state of one connection.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub status: ClientStatus,
    /// Next entry number the sender will ship when streaming.
    pub cursor: u64,
}

pub struct StreamHub {
    clients: Mutex<HashMap<ConnId, Subscription>>,
    next_id: AtomicU64,
    commits: watch::Receiver<u64>,
}

impl StreamHub {
    pub fn new(commits: watch::Receiver<u64>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            commits,
        }
    }

    /// Track a newly accepted connection. Connections start stopped.
    pub async fn register(&self) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().await.insert(
            id,
            Subscription {
                status: ClientStatus::Stopped,
                cursor: 0,
            },
        );
        debug!(conn = id, "client registered");
        id
    }

    /// Move a stopped client into streaming from `from_entry`.
    pub async fn subscribe(&self, id: ConnId, from_entry: u64) -> Result<()> {
        let mut clients = self.clients.lock().await;
        let client = clients
            .get_mut(&id)
            .ok_or_else(|| Error::BadState(format!("unknown connection {}", id)))?;
        if client.status != ClientStatus::Stopped {
            return Err(Error::BadState("client already started".to_string()));
        }
        client.status = ClientStatus::Streaming;
        client.cursor = from_entry;
        debug!(conn = id, from_entry, "client subscribed");
        Ok(())
    }

    /// Move a streaming client back to stopped.
    pub async fn unsubscribe(&self, id: ConnId) -> Result<()> {
        let mut clients = self.clients.lock().await;
        let client = clients
            .get_mut(&id)
            .ok_or_else(|| Error::BadState(format!("unknown connection {}", id)))?;
        if client.status != ClientStatus::Streaming {
            return Err(Error::BadState("client already stopped".to_string()));
        }
        client.status = ClientStatus::Stopped;
        debug!(conn = id, "client unsubscribed");
        Ok(())
    }

    /// Commands other than Start/Stop require a stopped client.
    pub async fn require_stopped(&self, id: ConnId) -> Result<()> {
        match self.status(id).await {
            Some(ClientStatus::Stopped) => Ok(()),
            Some(_) => Err(Error::BadState(
                "command not allowed while streaming".to_string(),
            )),
            None => Err(Error::BadState(format!("unknown connection {}", id))),
        }
    }

    pub async fn status(&self, id: ConnId) -> Option<ClientStatus> {
        self.clients.lock().await.get(&id).map(|c| c.status)
    }

    pub async fn subscription(&self, id: ConnId) -> Option<Subscription> {
        self.clients.lock().await.get(&id).copied()
    }

    /// Record the sender's progress through the log.
    pub async fn set_cursor(&self, id: ConnId, cursor: u64) {
        if let Some(client) = self.clients.lock().await.get_mut(&id) {
            client.cursor = cursor;
        }
    }

    /// Mark a client dropped for falling behind.
    pub async fn kill(&self, id: ConnId) {
        if let Some(client) = self.clients.lock().await.get_mut(&id) {
            client.status = ClientStatus::Killed;
        }
    }

    /// Forget a connection entirely.
    pub async fn drop_client(&self, id: ConnId) {
        self.clients.lock().await.remove(&id);
        debug!(conn = id, "client dropped");
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Currently visible `total_entries`.
    pub fn watermark(&self) -> u64 {
        *self.commits.borrow()
    }

    /// Watch handle a sender task blocks on while caught up.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commits.clone()
    }
}
