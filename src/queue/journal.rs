//! Append-only queue journal.
//!
//! Every state change of the queue is written here as a framed entry and
//! fsynced before the call returns. Replaying the journal from the start
//! rebuilds the queue. Records stay on disk; callers keep the offset of a
//! record's `Enqueue` frame and read it back with [`Journal::read_record`].

use crate::error::StorageError;
use crate::record::LogRecord;
use crate::types::RecordId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, StorageError>;

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"LSQ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_LEN: u64 = 5;

/// Upper bound for a single entry.
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

/// One journaled queue operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// Id high-water mark, written first by every rewrite.
    Checkpoint { next_id: RecordId },
    /// A record was accepted. The record is stored as JSON bytes.
    Enqueue { id: RecordId, payload: Vec<u8> },
    /// Records were claimed by a flush.
    Lease { ids: Vec<RecordId> },
    /// Leased records went back to pending.
    Release { ids: Vec<RecordId> },
    /// Records were delivered and deleted.
    Remove { ids: Vec<RecordId> },
}

impl JournalEntry {
    pub fn enqueue(record: &LogRecord) -> Result<Self> {
        let payload =
            serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(JournalEntry::Enqueue {
            id: record.id,
            payload,
        })
    }

    /// Decode the record carried by an `Enqueue` entry.
    pub fn decode_record(payload: &[u8]) -> Result<LogRecord> {
        serde_json::from_slice(payload).map_err(|e| StorageError::Deserialization(e.to_string()))
    }
}

/// Summary of reading a journal from disk.
#[derive(Debug, Default)]
pub struct Replay {
    /// Valid entries read.
    pub entries: u64,
    /// Bytes after the last valid entry (a torn or corrupt tail).
    pub discarded_bytes: u64,
}

/// Handle to the journal file: an append writer plus a reader for random
/// access to earlier frames.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    reader: File,
    /// Offset where the next frame goes.
    end: u64,
    /// Entries written since the last rewrite.
    entry_count: u64,
}

impl Journal {
    /// Open the journal for appending, creating it if missing.
    ///
    /// Every valid entry is passed to `visit` with its frame offset, in file
    /// order.
    pub fn open(
        path: impl AsRef<Path>,
        mut visit: impl FnMut(u64, JournalEntry) -> Result<()>,
    ) -> Result<(Self, Replay)> {
        let path = path.as_ref().to_path_buf();

        // A file shorter than the header is a creation torn by a crash.
        let replay = if path.exists() && fs::metadata(&path)?.len() >= HEADER_LEN {
            Self::read_all(&path, &mut visit)?
        } else {
            Self::create_empty(&path)?;
            Replay::default()
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        // A discarded tail stays in the file until the next rewrite
        let end = fs::metadata(&path)?.len();

        Ok((
            Self {
                reader: File::open(&path)?,
                path,
                writer: BufWriter::new(file),
                end,
                entry_count: replay.entries,
            },
            replay,
        ))
    }

    /// Append one entry and fsync. Returns the offset of its frame.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<u64> {
        let offset = self.end;
        let len = Self::write_entry(&mut self.writer, entry)?;
        self.writer.flush()?;
        // fsync for durability
        self.writer.get_ref().sync_all()?;
        self.end += len;
        self.entry_count += 1;
        Ok(offset)
    }

    /// Read the entry whose frame starts at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<JournalEntry> {
        let mut reader = &self.reader;
        reader.seek(SeekFrom::Start(offset))?;
        let (entry, _) = Self::read_entry(&mut BufReader::new(reader))?;
        Ok(entry)
    }

    /// Read the record of the `Enqueue` frame at `offset`.
    pub fn read_record(&self, offset: u64) -> Result<LogRecord> {
        match self.read_at(offset)? {
            JournalEntry::Enqueue { payload, .. } => JournalEntry::decode_record(&payload),
            other => Err(StorageError::Corruption(format!(
                "expected a record at offset {offset}, found {other:?}"
            ))),
        }
    }

    /// Number of entries in the file.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Start writing a replacement journal next to this one.
    pub fn begin_rewrite(&self) -> Result<Rewrite> {
        let tmp_path = self.path.with_extension("compact.tmp");
        let mut writer = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?,
        );
        writer.write_all(JOURNAL_MAGIC)?;
        writer.write_all(&[JOURNAL_VERSION])?;

        Ok(Rewrite {
            tmp_path,
            writer,
            end: HEADER_LEN,
            entry_count: 0,
        })
    }

    /// Atomically replace the journal with the content of `rewrite`.
    ///
    /// The temp file is fsynced, renamed over the journal, and the directory
    /// is fsynced. A crash at any point leaves either the old or the new
    /// journal intact.
    pub fn commit_rewrite(&mut self, mut rewrite: Rewrite) -> Result<()> {
        rewrite.writer.flush()?;
        rewrite.writer.get_ref().sync_all()?;
        drop(rewrite.writer);

        fs::rename(&rewrite.tmp_path, &self.path)?;
        fsync_dir(&self.path)?;

        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.reader = File::open(&self.path)?;
        self.end = rewrite.end;
        self.entry_count = rewrite.entry_count;
        Ok(())
    }

    fn create_empty(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Write header
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        fsync_dir(path)?;
        Ok(())
    }

    fn read_all(
        path: &Path,
        visit: &mut impl FnMut(u64, JournalEntry) -> Result<()>,
    ) -> Result<Replay> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // Verify header
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StorageError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = 0;
        let mut consumed = HEADER_LEN;
        loop {
            match Self::read_entry(&mut reader) {
                Ok((entry, len)) => {
                    visit(consumed, entry)?;
                    entries += 1;
                    consumed += len;
                }
                Err(StorageError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::warn!(error = %e, offset = consumed, "stopping journal replay at bad entry");
                    break;
                }
            }
        }

        Ok(Replay {
            entries,
            discarded_bytes: file_len.saturating_sub(consumed),
        })
    }

    /// Write one frame, returning its length.
    fn write_entry<W: Write>(writer: &mut W, entry: &JournalEntry) -> Result<u64> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(4 + encoded.len() as u64 + 4)
    }

    /// Read one entry, returning it with its framed length.
    fn read_entry<R: Read>(reader: &mut R) -> Result<(JournalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(StorageError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption("journal checksum mismatch".into()));
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, 4 + len as u64 + 4))
    }
}

/// A replacement journal being written. Dropping it without
/// [`Journal::commit_rewrite`] leaves the current journal untouched.
pub struct Rewrite {
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    end: u64,
    entry_count: u64,
}

impl Rewrite {
    /// Write one entry. Returns the offset its frame will have once the
    /// rewrite is committed.
    pub fn push(&mut self, entry: &JournalEntry) -> Result<u64> {
        let offset = self.end;
        self.end += Journal::write_entry(&mut self.writer, entry)?;
        self.entry_count += 1;
        Ok(offset)
    }
}

/// fsync the directory holding `path` so renames and creations are durable.
fn fsync_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => File::open(".")?.sync_all(),
    }
}
