//! Transactional heart of the stream: the atomic-op state machine.
//!
//! ```text
//!    idle --begin--> staging --commit--> idle
//!                        \----rollback--> idle
//! ```
//!
//! Entries added while staging are written to disk immediately but stay
//! invisible: the header counters and the entry location table only move
//! on commit, and readers trust nothing past them. Rollback truncates the
//! file back to the length snapshotted at begin.
//!
//! All state transitions and the read path share one lock. The lock is
//! held across file writes but never across the network; commit publishes
//! the newly visible watermark through a watch channel only after the lock
//! is released, so subscribers wake to a fully committed range or not at
//! all.

use std::path::Path;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use datastream_core::{Entry, EntryType, Error, Header, Result, StreamType};

use crate::bookmark::BookmarkIndex;
use crate::file::{EntryLocation, FileStore, StoreReader};

#[derive(Debug)]
struct AtomicOp {
    total_entries_0: u64,
    total_length_0: u64,
    staged: Vec<EntryLocation>,
    staged_bookmarks: Vec<(Bytes, u64)>,
}

#[derive(Debug)]
struct EngineInner {
    store: FileStore,
    bookmarks: BookmarkIndex,
    /// Location of every committed entry, indexed by entry number.
    locations: Vec<EntryLocation>,
    op: Option<AtomicOp>,
}

/// Single-writer engine over one stream file.
///
/// Writers drive `begin_atomic` / `add_entry` / `add_bookmark` /
/// `commit_atomic` / `rollback_atomic`; the server's read paths use the
/// query methods and [`subscribe_commits`](StreamEngine::subscribe_commits)
/// to follow the committed watermark.
#[derive(Debug)]
pub struct StreamEngine {
    inner: Mutex<EngineInner>,
    reader: Mutex<StoreReader>,
    commits: watch::Sender<u64>,
    stream_type: StreamType,
}

impl StreamEngine {
    /// Open the stream file, scan it to rebuild the bookmark index and the
    /// entry location table, and start from its committed counters.
    pub async fn open(path: impl AsRef<Path>, stream_type: StreamType) -> Result<Self> {
        let store = FileStore::open(path, stream_type).await?;
        let scanned = store.scan().await?;

        let mut bookmarks = BookmarkIndex::new();
        let mut locations = Vec::with_capacity(scanned.len());
        for entry in scanned {
            if let Some(key) = entry.bookmark_key {
                bookmarks.insert(key, entry.number);
            }
            locations.push(entry.location);
        }

        let total = store.header().total_entries;
        info!(
            entries = total,
            bookmarks = bookmarks.len(),
            "stream engine ready"
        );

        let reader = store.reader().await?;
        let (commits, _) = watch::channel(total);
        Ok(Self {
            inner: Mutex::new(EngineInner {
                store,
                bookmarks,
                locations,
                op: None,
            }),
            reader: Mutex::new(reader),
            commits,
            stream_type,
        })
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    // ---------------------------------------------------------------
    // Atomic operations (single writer)
    // ---------------------------------------------------------------

    /// Start an atomic operation. Fails with `BadState` if one is already
    /// in progress; it is never committed implicitly.
    pub async fn begin_atomic(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.op.is_some() {
            return Err(Error::BadState(
                "atomic operation already in progress".to_string(),
            ));
        }
        let header = guard.store.header();
        guard.op = Some(AtomicOp {
            total_entries_0: header.total_entries,
            total_length_0: header.total_length,
            staged: Vec::new(),
            staged_bookmarks: Vec::new(),
        });
        Ok(())
    }

    /// Append one entry inside the current atomic operation and return the
    /// number it was assigned. The bytes hit the file now; visibility waits
    /// for commit.
    ///
    /// A failed write leaves the operation in staging; the caller is
    /// expected to roll back, which truncates any partial frame away.
    pub async fn add_entry(&self, entry_type: EntryType, payload: Bytes) -> Result<u64> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let op = inner
            .op
            .as_mut()
            .ok_or_else(|| Error::BadState("no atomic operation in progress".to_string()))?;

        let number = op.total_entries_0 + op.staged.len() as u64;
        let frame = Entry::new(entry_type, number, payload).encode();
        let offset = inner.store.append_frame(&frame).await?;
        op.staged.push(EntryLocation {
            offset,
            length: frame.len() as u32,
        });
        Ok(number)
    }

    /// Append a bookmark entry whose payload is `key`, staging the
    /// key-to-number pair for the index as well.
    pub async fn add_bookmark(&self, key: Bytes) -> Result<u64> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let op = inner
            .op
            .as_mut()
            .ok_or_else(|| Error::BadState("no atomic operation in progress".to_string()))?;

        let number = op.total_entries_0 + op.staged.len() as u64;
        let frame = Entry::new(EntryType::BOOKMARK, number, key.clone()).encode();
        let offset = inner.store.append_frame(&frame).await?;
        op.staged.push(EntryLocation {
            offset,
            length: frame.len() as u32,
        });
        op.staged_bookmarks.push((key, number));
        Ok(number)
    }

    /// Make everything staged since begin visible at once: bookmarks land
    /// in the index, the header counters advance on disk, and the commit
    /// watermark wakes every subscriber.
    pub async fn commit_atomic(&self) -> Result<()> {
        let new_total = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;

            let (new_total, new_length) = match inner.op.as_ref() {
                None => {
                    return Err(Error::BadState(
                        "no atomic operation in progress".to_string(),
                    ))
                }
                Some(op) => (
                    op.total_entries_0 + op.staged.len() as u64,
                    op.total_length_0
                        + op.staged.iter().map(|l| u64::from(l.length)).sum::<u64>(),
                ),
            };

            // A failed header write keeps the operation staged so the
            // caller can still roll back.
            inner.store.commit_header(new_total, new_length).await?;

            if let Some(op) = inner.op.take() {
                for (key, number) in op.staged_bookmarks {
                    if let Some(previous) = inner.bookmarks.insert(key, number) {
                        debug!(previous, number, "bookmark key overwritten");
                    }
                }
                debug!(
                    entries = op.staged.len(),
                    total = new_total,
                    "atomic operation committed"
                );
                inner.locations.extend(op.staged);
            }
            new_total
        };

        // Publish outside the lock; the range is already fully visible.
        self.commits.send_replace(new_total);
        Ok(())
    }

    /// Throw away everything staged since begin: truncate the file back to
    /// the snapshot length and drop the staged bookmarks. Nothing is
    /// published.
    pub async fn rollback_atomic(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let restore = match inner.op.as_ref() {
            None => {
                return Err(Error::BadState(
                    "no atomic operation in progress".to_string(),
                ))
            }
            Some(op) => op.total_length_0,
        };
        inner.store.truncate_to(restore).await?;
        inner.op = None;
        debug!(restored_length = restore, "atomic operation rolled back");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------

    /// Snapshot of the committed header.
    pub async fn header(&self) -> Header {
        self.inner.lock().await.store.header()
    }

    pub async fn total_entries(&self) -> u64 {
        self.inner.lock().await.store.header().total_entries
    }

    /// Where a committed entry lives in the file. Staged entries are not
    /// visible here until their operation commits.
    pub async fn entry_location(&self, number: u64) -> Result<EntryLocation> {
        let guard = self.inner.lock().await;
        if number >= guard.store.header().total_entries {
            return Err(Error::NotFound(format!("entry {}", number)));
        }
        Ok(guard.locations[number as usize])
    }

    /// Entry number a bookmark key points at.
    pub async fn bookmark(&self, key: &[u8]) -> Result<u64> {
        self.inner.lock().await.bookmarks.get(key)
    }

    /// Read one committed entry through the engine's shared read handle.
    pub async fn read_entry(&self, number: u64) -> Result<Entry> {
        let location = self.entry_location(number).await?;
        let mut reader = self.reader.lock().await;
        reader.read_entry(location).await
    }

    /// Read the entry a bookmark points at.
    pub async fn bookmark_entry(&self, key: &[u8]) -> Result<Entry> {
        let number = self.bookmark(key).await?;
        self.read_entry(number).await
    }

    /// Open a dedicated read handle, for streaming paths that should not
    /// share the engine's.
    pub async fn new_reader(&self) -> Result<StoreReader> {
        self.inner.lock().await.store.reader().await
    }

    /// Follow the committed watermark. The receiver's value is the visible
    /// `total_entries`; it only ever moves forward, one whole commit at a
    /// time.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_engine(dir: &TempDir) -> StreamEngine {
        StreamEngine::open(dir.path().join("stream.bin"), StreamType::Sequencer)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_atomic_op() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;

        engine.begin_atomic().await.unwrap();
        let number = engine
            .add_entry(EntryType(2), Bytes::from_static(&[0x01, 0x02, 0x03]))
            .await
            .unwrap();
        engine.commit_atomic().await.unwrap();

        assert_eq!(number, 0);
        let header = engine.header().await;
        assert_eq!(header.total_entries, 1);
        assert_eq!(header.total_length, 49);

        let on_disk = tokio::fs::metadata(dir.path().join("stream.bin"))
            .await
            .unwrap()
            .len();
        assert_eq!(on_disk, 49);

        let entry = engine.read_entry(0).await.unwrap();
        assert_eq!(entry.number, 0);
        assert_eq!(entry.entry_type, EntryType(2));
        assert_eq!(entry.payload, Bytes::from_static(&[0x01, 0x02, 0x03]));
    }

    #[tokio::test]
    async fn test_entries_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;

        engine.begin_atomic().await.unwrap();
        engine
            .add_entry(EntryType(2), Bytes::from_static(&[1]))
            .await
            .unwrap();

        assert_eq!(engine.total_entries().await, 0);
        assert!(matches!(
            engine.read_entry(0).await.unwrap_err(),
            Error::NotFound(_)
        ));

        engine.commit_atomic().await.unwrap();
        assert_eq!(engine.total_entries().await, 1);
        assert!(engine.read_entry(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_numbers_are_contiguous_across_ops() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;

        engine.begin_atomic().await.unwrap();
        assert_eq!(
            engine.add_entry(EntryType(1), Bytes::from_static(&[1])).await.unwrap(),
            0
        );
        assert_eq!(
            engine.add_entry(EntryType(1), Bytes::from_static(&[2])).await.unwrap(),
            1
        );
        engine.commit_atomic().await.unwrap();

        engine.begin_atomic().await.unwrap();
        assert_eq!(
            engine.add_entry(EntryType(1), Bytes::from_static(&[3])).await.unwrap(),
            2
        );
        engine.commit_atomic().await.unwrap();

        assert_eq!(engine.total_entries().await, 3);
    }

    #[tokio::test]
    async fn test_rollback_restores_file_and_counters() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;
        let path = dir.path().join("stream.bin");

        // Build up five committed entries first.
        engine.begin_atomic().await.unwrap();
        for i in 0..5u8 {
            engine
                .add_entry(EntryType(2), Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        engine.commit_atomic().await.unwrap();
        let committed_len = tokio::fs::metadata(&path).await.unwrap().len();

        engine.begin_atomic().await.unwrap();
        engine.add_entry(EntryType(2), Bytes::from_static(&[9])).await.unwrap();
        engine.add_entry(EntryType(2), Bytes::from_static(&[9])).await.unwrap();
        engine.rollback_atomic().await.unwrap();

        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), committed_len);
        assert_eq!(engine.total_entries().await, 5);

        // The next op picks up numbering where the committed log ended.
        engine.begin_atomic().await.unwrap();
        let number = engine
            .add_entry(EntryType(2), Bytes::from_static(&[5]))
            .await
            .unwrap();
        engine.commit_atomic().await.unwrap();
        assert_eq!(number, 5);
    }

    #[tokio::test]
    async fn test_double_begin_is_bad_state() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;

        engine.begin_atomic().await.unwrap();
        let err = engine.begin_atomic().await.unwrap_err();
        assert!(matches!(err, Error::BadState(_)));

        // The original op is still intact.
        engine.add_entry(EntryType(1), Bytes::new()).await.unwrap();
        engine.commit_atomic().await.unwrap();
        assert_eq!(engine.total_entries().await, 1);
    }

    #[tokio::test]
    async fn test_ops_outside_staging_are_bad_state() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;

        assert!(matches!(
            engine
                .add_entry(EntryType(1), Bytes::new())
                .await
                .unwrap_err(),
            Error::BadState(_)
        ));
        assert!(matches!(
            engine.add_bookmark(Bytes::from_static(b"k")).await.unwrap_err(),
            Error::BadState(_)
        ));
        assert!(matches!(
            engine.commit_atomic().await.unwrap_err(),
            Error::BadState(_)
        ));
        assert!(matches!(
            engine.rollback_atomic().await.unwrap_err(),
            Error::BadState(_)
        ));
    }

    #[tokio::test]
    async fn test_bookmark_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;
        let key = Bytes::from_static(&[0x00, 0x2a]);

        engine.begin_atomic().await.unwrap();
        let k0 = engine.add_bookmark(key.clone()).await.unwrap();
        engine
            .add_entry(EntryType(2), Bytes::from_static(&[1, 2]))
            .await
            .unwrap();
        engine.commit_atomic().await.unwrap();

        assert_eq!(engine.bookmark(&key).await.unwrap(), k0);
        let entry = engine.bookmark_entry(&key).await.unwrap();
        assert_eq!(entry.number, k0);
        assert_eq!(entry.entry_type, EntryType::BOOKMARK);
        assert_eq!(entry.payload, key);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_bookmarks() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;
        let key = Bytes::from_static(b"rolled-back");

        engine.begin_atomic().await.unwrap();
        engine.add_bookmark(key.clone()).await.unwrap();
        engine.rollback_atomic().await.unwrap();

        assert!(matches!(
            engine.bookmark(&key).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_bookmark_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;
        let key = Bytes::from_static(b"dup");

        engine.begin_atomic().await.unwrap();
        engine.add_bookmark(key.clone()).await.unwrap();
        engine.commit_atomic().await.unwrap();

        engine.begin_atomic().await.unwrap();
        let second = engine.add_bookmark(key.clone()).await.unwrap();
        engine.commit_atomic().await.unwrap();

        assert_eq!(engine.bookmark(&key).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_commit_publishes_watermark_once() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;
        let mut commits = engine.subscribe_commits();
        assert_eq!(*commits.borrow_and_update(), 0);

        engine.begin_atomic().await.unwrap();
        for _ in 0..3 {
            engine.add_entry(EntryType(1), Bytes::new()).await.unwrap();
        }
        // Nothing published while staging.
        assert!(!commits.has_changed().unwrap());

        engine.commit_atomic().await.unwrap();
        commits.changed().await.unwrap();
        // The whole range becomes visible in one jump.
        assert_eq!(*commits.borrow_and_update(), 3);
    }

    #[tokio::test]
    async fn test_rollback_then_redo_matches_clean_run() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let engine_a = open_engine(&dir_a).await;
        let engine_b = open_engine(&dir_b).await;
        let payloads: Vec<Bytes> = vec![Bytes::from_static(&[1, 1]), Bytes::from_static(&[2])];

        // A: stage, roll back, then redo and commit.
        engine_a.begin_atomic().await.unwrap();
        for p in &payloads {
            engine_a.add_entry(EntryType(2), p.clone()).await.unwrap();
        }
        engine_a.rollback_atomic().await.unwrap();
        engine_a.begin_atomic().await.unwrap();
        for p in &payloads {
            engine_a.add_entry(EntryType(2), p.clone()).await.unwrap();
        }
        engine_a.commit_atomic().await.unwrap();

        // B: just the committed op.
        engine_b.begin_atomic().await.unwrap();
        for p in &payloads {
            engine_b.add_entry(EntryType(2), p.clone()).await.unwrap();
        }
        engine_b.commit_atomic().await.unwrap();

        let bytes_a = tokio::fs::read(dir_a.path().join("stream.bin")).await.unwrap();
        let bytes_b = tokio::fs::read(dir_b.path().join("stream.bin")).await.unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[tokio::test]
    async fn test_empty_commit_is_legal() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir).await;

        engine.begin_atomic().await.unwrap();
        engine.commit_atomic().await.unwrap();
        assert_eq!(engine.total_entries().await, 0);
        assert_eq!(engine.header().await.total_length, 29);
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_gap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.bin");
        {
            // Hand-build a file whose second entry skips a number.
            let mut store = FileStore::open(&path, StreamType::Sequencer).await.unwrap();
            let f0 = Entry::new(EntryType(2), 0, Bytes::from_static(&[1])).encode();
            let f2 = Entry::new(EntryType(2), 2, Bytes::from_static(&[2])).encode();
            store.append_frame(&f0).await.unwrap();
            store.append_frame(&f2).await.unwrap();
            store
                .commit_header(2, 29 + (f0.len() + f2.len()) as u64)
                .await
                .unwrap();
        }

        let err = StreamEngine::open(&path, StreamType::Sequencer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
