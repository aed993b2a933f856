//! Append-only commit log for the backing store.
//!
//! Record format (teacher of the engine's durability): a segment header of
//! magic bytes plus format version, then framed records
//! `[len: u32 LE][crc32: u32 LE][bincode payload]`. One record per committed
//! transaction, so replay can never observe half a commit.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cachet_common::error::{StoreError, StoreResult};

/// Magic bytes at the start of the log file.
pub const LOG_MAGIC: &[u8; 4] = b"CCH1";

/// Format version, bumped on any backward-incompatible record change.
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Header size: magic (4) + format version (4).
pub const LOG_HEADER_SIZE: usize = 8;

const LOG_FILENAME: &str = "cachet.log";

/// One staged row inside a commit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
}

/// One committed transaction: every entry becomes visible at `ts` atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub ts: u64,
    pub entries: Vec<LogEntry>,
}

/// Append-only log writer.
#[derive(Debug)]
pub struct LogWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    sync_writes: bool,
    written_bytes: u64,
}

impl LogWriter {
    /// Open (or create) the log in `dir`, returning the writer together with
    /// the records replayed from disk.
    pub fn open(dir: &Path, sync_writes: bool) -> StoreResult<(Self, Vec<CommitRecord>)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILENAME);

        let existing = if path.exists() { fs::read(&path)? } else { Vec::new() };
        let records = if existing.is_empty() {
            Vec::new()
        } else {
            parse_records(&existing)?
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut writer = BufWriter::new(file);

        let mut written_bytes = file_len;
        if file_len == 0 {
            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&LOG_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            written_bytes = LOG_HEADER_SIZE as u64;
        }

        Ok((
            Self {
                writer,
                path,
                sync_writes,
                written_bytes,
            },
            records,
        ))
    }

    /// Append one commit record and flush it. With `sync_writes` the data is
    /// also synced to the device before returning.
    pub fn append(&mut self, record: &CommitRecord) -> StoreResult<()> {
        let data = bincode::serialize(record)
            .map_err(|e| StoreError::Backing(format!("log encode: {}", e)))?;
        let len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer.flush()?;
        if self.sync_writes {
            self.writer.get_ref().sync_data()?;
        }
        self.written_bytes += 8 + data.len() as u64;
        Ok(())
    }

    /// Bytes written to the log since creation (header included).
    pub fn size(&self) -> u64 {
        self.written_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse every record in `data`. A bad magic or unsupported version fails the
/// open; a torn or checksum-mismatched tail record stops replay with a
/// warning, mirroring crash recovery of a partially flushed append.
fn parse_records(data: &[u8]) -> StoreResult<Vec<CommitRecord>> {
    if data.len() < LOG_HEADER_SIZE || &data[0..4] != LOG_MAGIC.as_slice() {
        return Err(StoreError::Corrupted("bad log magic".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != LOG_FORMAT_VERSION {
        return Err(StoreError::Corrupted(format!(
            "unsupported log format version {}",
            version
        )));
    }

    let mut records = Vec::new();
    let mut pos = LOG_HEADER_SIZE;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        pos += 8;

        if pos + len > data.len() {
            tracing::warn!(position = pos, "log truncated, stopping replay");
            break;
        }
        let payload = &data[pos..pos + len];
        if crc32fast::hash(payload) != checksum {
            tracing::warn!(position = pos, "log checksum mismatch, stopping replay");
            break;
        }
        match bincode::deserialize::<CommitRecord>(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(position = pos, error = %e, "log decode error, stopping replay");
                break;
            }
        }
        pos += len;
    }
    Ok(records)
}
