//! Header-prefixed append-only stream file.
//!
//! File layout:
//!
//! ```text
//! +------------------+---------+---------+-----+---------+
//! | header (29 bytes)| entry 0 | entry 1 | ... | entry N |
//! +------------------+---------+---------+-----+---------+
//! ```
//!
//! There is no trailing index or footer. The header's `total_length` and
//! `total_entries` counters are the commit point: bytes past `total_length`
//! are an uncommitted tail and are dropped the next time the file is opened.
//!
//! One [`FileStore`] owns the single write handle. Query and streaming paths
//! read through independent [`StoreReader`] handles so they never contend
//! with appends for file position.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use datastream_core::types::{ENTRY_FIXED_SIZE, HEADER_SIZE, PT_DATA};
use datastream_core::{Entry, EntryType, Error, Header, Result, StreamType};

/// Position and size of one entry frame inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub offset: u64,
    pub length: u32,
}

/// One entry as seen by a full-file scan.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub number: u64,
    pub entry_type: EntryType,
    pub location: EntryLocation,
    /// Payload of bookmark-typed entries, used to rebuild the index.
    pub bookmark_key: Option<Bytes>,
}

/// The single writer of a stream file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
    header: Header,
    write_pos: u64,
}

impl FileStore {
    /// Open a stream file, creating it with a fresh header if it does not
    /// exist.
    ///
    /// An existing file must carry a valid header whose stream type matches
    /// `stream_type`; anything else is `Incompatible`. A file longer than
    /// its recorded `total_length` has an uncommitted tail from an
    /// interrupted atomic operation, which is truncated away.
    pub async fn open(path: impl AsRef<Path>, stream_type: StreamType) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        let disk_len = file.metadata().await?.len();

        if disk_len == 0 {
            let header = Header::new(stream_type);
            file.write_all(&header.encode()).await?;
            file.sync_all().await?;
            info!(path = %path.display(), "created stream file");
            return Ok(Self {
                path,
                file,
                header,
                write_pos: HEADER_SIZE as u64,
            });
        }

        if disk_len < HEADER_SIZE as u64 {
            return Err(Error::Incompatible(format!(
                "file {} is only {} bytes",
                path.display(),
                disk_len
            )));
        }

        let mut head = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0)).await?;
        file.read_exact(&mut head).await?;
        // A garbage prefix means this is not a stream file at all.
        let header = Header::decode(&head).map_err(|e| match e {
            Error::Malformed(msg) => Error::Incompatible(msg),
            other => other,
        })?;

        if header.stream_type != stream_type {
            return Err(Error::Incompatible(format!(
                "file {} has stream type {:?}, expected {:?}",
                path.display(),
                header.stream_type,
                stream_type
            )));
        }

        if disk_len < header.total_length {
            return Err(Error::Corrupt(format!(
                "file {} is {} bytes but header records {}",
                path.display(),
                disk_len,
                header.total_length
            )));
        }
        if disk_len > header.total_length {
            warn!(
                path = %path.display(),
                dropped = disk_len - header.total_length,
                "dropping uncommitted tail"
            );
            file.set_len(header.total_length).await?;
        }

        let write_pos = header.total_length;
        info!(
            path = %path.display(),
            entries = header.total_entries,
            length = header.total_length,
            "opened stream file"
        );
        Ok(Self {
            path,
            file,
            header,
            write_pos,
        })
    }

    /// In-memory authoritative header. Updated only by [`commit_header`].
    ///
    /// [`commit_header`]: FileStore::commit_header
    pub fn header(&self) -> Header {
        self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a frame at the end of the file and return its pre-append
    /// offset. Does not touch the header.
    pub async fn append_frame(&mut self, frame: &[u8]) -> Result<u64> {
        let offset = self.write_pos;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(frame).await?;
        self.write_pos += frame.len() as u64;
        Ok(offset)
    }

    /// Hard-truncate the file back to `offset` bytes.
    pub async fn truncate_to(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset).await?;
        self.write_pos = offset;
        Ok(())
    }

    /// Rewrite the header region with the new counters and ask the OS to
    /// flush. The in-memory header is only updated once the bytes are down.
    pub async fn commit_header(&mut self, total_entries: u64, total_length: u64) -> Result<()> {
        let header = Header {
            stream_type: self.header.stream_type,
            total_length,
            total_entries,
        };
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(&header.encode()).await?;
        self.file.sync_all().await?;
        self.header = header;
        Ok(())
    }

    /// Walk every entry from offset 29 to EOF.
    ///
    /// Entry numbers must form `0, 1, 2, ...` and the byte count must land
    /// exactly on the header's `total_length`; a gap or mismatch is
    /// `Corrupt`.
    pub async fn scan(&self) -> Result<Vec<ScannedEntry>> {
        let file = File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        let mut head = [0u8; HEADER_SIZE];
        reader.read_exact(&mut head).await?;

        let mut entries: Vec<ScannedEntry> = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        loop {
            let mut fixed = [0u8; ENTRY_FIXED_SIZE];
            match reader.read_exact(&mut fixed).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            if fixed[0] != PT_DATA {
                return Err(Error::Corrupt(format!(
                    "bad frame tag 0x{:02x} at offset {}",
                    fixed[0], offset
                )));
            }
            let length = u32::from_be_bytes([fixed[1], fixed[2], fixed[3], fixed[4]]);
            if (length as usize) < ENTRY_FIXED_SIZE {
                return Err(Error::Corrupt(format!(
                    "frame length {} at offset {}",
                    length, offset
                )));
            }

            let mut rest = vec![0u8; length as usize - ENTRY_FIXED_SIZE];
            match reader.read_exact(&mut rest).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::Corrupt(format!(
                        "truncated entry at offset {}",
                        offset
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            let mut frame = Vec::with_capacity(length as usize);
            frame.extend_from_slice(&fixed);
            frame.extend_from_slice(&rest);
            let entry = Entry::decode(&frame)?;

            let expected = entries.len() as u64;
            if entry.number != expected {
                return Err(Error::Corrupt(format!(
                    "entry number {} where {} was expected",
                    entry.number, expected
                )));
            }

            let bookmark_key = entry
                .entry_type
                .is_bookmark()
                .then(|| entry.payload.clone());
            entries.push(ScannedEntry {
                number: entry.number,
                entry_type: entry.entry_type,
                location: EntryLocation { offset, length },
                bookmark_key,
            });
            offset += length as u64;
        }

        if offset != self.header.total_length {
            return Err(Error::Corrupt(format!(
                "entries end at offset {} but header records {}",
                offset, self.header.total_length
            )));
        }
        if entries.len() as u64 != self.header.total_entries {
            return Err(Error::Corrupt(format!(
                "{} entries on disk but header records {}",
                entries.len(),
                self.header.total_entries
            )));
        }
        Ok(entries)
    }

    /// Open an independent read handle onto the file.
    pub async fn reader(&self) -> Result<StoreReader> {
        Ok(StoreReader {
            file: File::open(&self.path).await?,
        })
    }
}

/// Read-only handle for query and streaming paths.
#[derive(Debug)]
pub struct StoreReader {
    file: File,
}

impl StoreReader {
    /// Read one raw entry frame. The bytes are wire-ready as-is.
    pub async fn read_frame(&mut self, location: EntryLocation) -> Result<Bytes> {
        self.file.seek(SeekFrom::Start(location.offset)).await?;
        let mut buf = vec![0u8; location.length as usize];
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn read_entry(&mut self, location: EntryLocation) -> Result<Entry> {
        Entry::decode(&self.read_frame(location).await?)
    }
}
