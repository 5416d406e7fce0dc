//! End-to-end tests driving a real server over TCP with the real client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use datastream_client::{ClientError, ClientResult, DiscardEntries, EntryProcessor, StreamClient};
use datastream_core::{Entry, EntryType, StreamType};
use datastream_server::{ServerConfig, StreamServer};
use datastream_storage::StreamEngine;

const WAIT: Duration = Duration::from_secs(5);

/// Forwards streamed entries into a channel the test can assert on.
struct ChannelProcessor(mpsc::UnboundedSender<Entry>);

#[async_trait]
impl EntryProcessor for ChannelProcessor {
    async fn process_entry(&self, entry: Entry) -> ClientResult<()> {
        let _ = self.0.send(entry);
        Ok(())
    }
}

async fn start_server(dir: &TempDir) -> (Arc<StreamEngine>, SocketAddr) {
    let engine = Arc::new(
        StreamEngine::open(dir.path().join("stream.bin"), StreamType::Sequencer)
            .await
            .unwrap(),
    );
    let server = StreamServer::new(
        engine.clone(),
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            packet_queue: 64,
        },
    );
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.run());
    (engine, addr)
}

fn streaming_client_parts() -> (Arc<ChannelProcessor>, mpsc::UnboundedReceiver<Entry>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelProcessor(tx)), rx)
}

async fn commit_one(engine: &StreamEngine, entry_type: u32, payload: &[u8]) -> u64 {
    engine.begin_atomic().await.unwrap();
    let number = engine
        .add_entry(EntryType(entry_type), Bytes::copy_from_slice(payload))
        .await
        .unwrap();
    engine.commit_atomic().await.unwrap();
    number
}

#[tokio::test]
async fn test_header_and_single_entry_query() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;

    let number = commit_one(&engine, 2, &[0x01, 0x02, 0x03]).await;
    assert_eq!(number, 0);

    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, Arc::new(DiscardEntries))
        .await
        .unwrap();

    let header = client.header().await.unwrap();
    assert_eq!(header.total_entries, 1);
    assert_eq!(header.total_length, 49);
    assert_eq!(client.last_header(), Some(header));

    let entry = client.entry(0).await.unwrap();
    assert_eq!(entry.number, 0);
    assert_eq!(entry.entry_type, EntryType(2));
    assert_eq!(entry.payload, Bytes::from_static(&[0x01, 0x02, 0x03]));
}

#[tokio::test]
async fn test_entry_query_past_end_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;
    commit_one(&engine, 2, &[1]).await;

    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, Arc::new(DiscardEntries))
        .await
        .unwrap();

    match client.entry(5).await {
        Err(ClientError::Command { code, message }) => {
            assert_ne!(code, 0);
            assert!(message.contains("not found"), "got {:?}", message);
        }
        other => panic!("expected command error, got {:?}", other.map(|e| e.number)),
    }

    // The connection is still usable afterwards.
    assert!(client.entry(0).await.is_ok());
}

#[tokio::test]
async fn test_streaming_receives_committed_entries_in_order() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;

    // Backlog committed before the client subscribes.
    commit_one(&engine, 1, &[0]).await;
    commit_one(&engine, 1, &[1]).await;

    let (processor, mut rx) = streaming_client_parts();
    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, processor)
        .await
        .unwrap();
    client.start_from(0).await.unwrap();

    // Live entries committed after the subscription.
    commit_one(&engine, 1, &[2]).await;
    commit_one(&engine, 1, &[3]).await;

    for expected in 0..4u64 {
        let entry = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(entry.number, expected);
        assert_eq!(entry.payload, Bytes::from(vec![expected as u8]));
    }
}

#[tokio::test]
async fn test_commit_is_all_or_nothing_to_subscribers() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;

    let (processor, mut rx) = streaming_client_parts();
    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, processor)
        .await
        .unwrap();
    client.start_from(0).await.unwrap();

    engine.begin_atomic().await.unwrap();
    for i in 0..3u8 {
        engine
            .add_entry(EntryType(1), Bytes::from(vec![i]))
            .await
            .unwrap();
    }

    // Nothing may arrive while the operation is still staging.
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "entry leaked before commit"
    );

    engine.commit_atomic().await.unwrap();
    for expected in 0..3u64 {
        let entry = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(entry.number, expected);
    }
}

#[tokio::test]
async fn test_rolled_back_entries_never_reach_subscribers() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;

    let (processor, mut rx) = streaming_client_parts();
    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, processor)
        .await
        .unwrap();
    client.start_from(0).await.unwrap();

    engine.begin_atomic().await.unwrap();
    engine
        .add_entry(EntryType(1), Bytes::from_static(b"doomed"))
        .await
        .unwrap();
    engine.rollback_atomic().await.unwrap();

    commit_one(&engine, 1, b"kept").await;

    let entry = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(entry.number, 0);
    assert_eq!(entry.payload, Bytes::from_static(b"kept"));
}

#[tokio::test]
async fn test_bookmark_round_trip_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;
    let key = [0x00u8, 0x2a];

    engine.begin_atomic().await.unwrap();
    let k0 = engine.add_bookmark(Bytes::copy_from_slice(&key)).await.unwrap();
    engine
        .add_entry(EntryType(2), Bytes::from_static(&[7, 7]))
        .await
        .unwrap();
    engine.commit_atomic().await.unwrap();

    let (processor, mut rx) = streaming_client_parts();
    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, processor)
        .await
        .unwrap();

    let entry = client.bookmark(&key).await.unwrap();
    assert_eq!(entry.number, k0);
    assert_eq!(entry.entry_type, EntryType::BOOKMARK);
    assert_eq!(entry.payload, Bytes::copy_from_slice(&key));

    client.start_from_bookmark(&key).await.unwrap();
    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.number, k0);
    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.number, k0 + 1);
}

#[tokio::test]
async fn test_unknown_bookmark_keeps_client_stopped() {
    let dir = TempDir::new().unwrap();
    let (_engine, addr) = start_server(&dir).await;

    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, Arc::new(DiscardEntries))
        .await
        .unwrap();

    assert!(matches!(
        client.start_from_bookmark(b"missing").await,
        Err(ClientError::Command { .. })
    ));

    // Still stopped, so a header query is accepted.
    assert!(client.header().await.is_ok());
}

#[tokio::test]
async fn test_bad_state_commands_get_error_results() {
    let dir = TempDir::new().unwrap();
    let (_engine, addr) = start_server(&dir).await;

    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, Arc::new(DiscardEntries))
        .await
        .unwrap();

    // Stop while stopped.
    match client.stop().await {
        Err(ClientError::Command { code, .. }) => assert_ne!(code, 0),
        other => panic!("expected command error, got {:?}", other),
    }

    // Start twice.
    client.start_from(0).await.unwrap();
    assert!(matches!(
        client.start_from(0).await,
        Err(ClientError::Command { .. })
    ));

    // Header while streaming.
    assert!(matches!(
        client.header().await,
        Err(ClientError::Command { .. })
    ));

    // Stop and the connection is healthy again.
    client.stop().await.unwrap();
    assert!(client.header().await.is_ok());
}

#[tokio::test]
async fn test_unknown_command_disconnects_without_result() {
    let dir = TempDir::new().unwrap();
    let (_engine, addr) = start_server(&dir).await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut frame = Vec::new();
    frame.extend_from_slice(&99u64.to_be_bytes());
    frame.extend_from_slice(&StreamType::Sequencer.as_u64().to_be_bytes());
    raw.write_all(&frame).await.unwrap();

    // The server closes without sending anything back.
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_stream_type_mismatch_disconnects() {
    let dir = TempDir::new().unwrap();
    let (_engine, addr) = start_server(&dir).await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut frame = Vec::new();
    frame.extend_from_slice(&1u64.to_be_bytes());
    frame.extend_from_slice(&7u64.to_be_bytes());
    raw.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_result_precedes_payload_on_the_wire() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;
    commit_one(&engine, 2, &[0xaa]).await;

    // Speak the protocol by hand to observe raw byte order.
    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut frame = Vec::new();
    frame.extend_from_slice(&3u64.to_be_bytes()); // Header command
    frame.extend_from_slice(&StreamType::Sequencer.as_u64().to_be_bytes());
    raw.write_all(&frame).await.unwrap();

    // First packet on the wire must be the Result, tagged 0xff.
    let mut tag = [0u8; 1];
    raw.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], 0xff);

    let mut rest = [0u8; 8];
    raw.read_exact(&mut rest).await.unwrap();
    let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let error_num = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
    assert_eq!(error_num, 0);
    let mut text = vec![0u8; length - 9];
    raw.read_exact(&mut text).await.unwrap();

    // Then the Header packet, tagged 0x01.
    raw.read_exact(&mut tag).await.unwrap();
    assert_eq!(tag[0], 0x01);
}

#[tokio::test]
async fn test_two_subscribers_see_the_same_stream() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;

    let (proc_a, mut rx_a) = streaming_client_parts();
    let (proc_b, mut rx_b) = streaming_client_parts();
    let mut client_a = StreamClient::connect(addr.to_string(), StreamType::Sequencer, proc_a)
        .await
        .unwrap();
    let mut client_b = StreamClient::connect(addr.to_string(), StreamType::Sequencer, proc_b)
        .await
        .unwrap();
    client_a.start_from(0).await.unwrap();
    client_b.start_from(0).await.unwrap();

    for i in 0..5u8 {
        commit_one(&engine, 1, &[i]).await;
    }

    for expected in 0..5u64 {
        let a = timeout(WAIT, rx_a.recv()).await.unwrap().unwrap();
        let b = timeout(WAIT, rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(a.number, expected);
        assert_eq!(b.number, expected);
        assert_eq!(a.payload, b.payload);
    }
}

#[tokio::test]
async fn test_start_from_latest_skips_backlog() {
    let dir = TempDir::new().unwrap();
    let (engine, addr) = start_server(&dir).await;

    commit_one(&engine, 1, b"old").await;

    let (processor, mut rx) = streaming_client_parts();
    let mut client = StreamClient::connect(addr.to_string(), StreamType::Sequencer, processor)
        .await
        .unwrap();
    client.start_from_latest().await.unwrap();

    commit_one(&engine, 1, b"new").await;

    let entry = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(entry.number, 1);
    assert_eq!(entry.payload, Bytes::from_static(b"new"));
}
