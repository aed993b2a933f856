//! The managed-timestamp backing store.
//!
//! A compact embedded key-value store with the contract the engine composes
//! over: caller-supplied commit timestamps, snapshot reads at a timestamp,
//! every version of every key kept forever, prefix/key iteration, a streaming
//! export and a bulk loader. Durability comes from the append-only commit log;
//! the full version index lives in memory and is rebuilt by replay on open.
//!
//! Commits are atomic: one framed log record per transaction, published to the
//! in-memory index under the write lock only after the record is on disk.

pub mod log;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use cachet_common::config::Options;
use cachet_common::error::{StoreError, StoreResult};
use cachet_common::types::{KvList, RawKv};

use self::log::{CommitRecord, LogEntry, LogWriter};

/// Snapshot sentinel meaning "the newest committed version of everything".
/// Exceeds any plausible commit timestamp.
pub const SNAPSHOT_LATEST: u64 = u64::MAX;

/// Rows per batch pushed by the export stream and buffered by the loader.
const STREAM_BATCH_SIZE: usize = 1024;

/// Capacity of the channel feeding the async committer thread.
const COMMITTER_CHANNEL_CAPACITY: usize = 1024;

/// One stored version of a key.
#[derive(Debug, Clone)]
struct Version {
    ts: u64,
    user_meta: u8,
    value: Vec<u8>,
}

/// Iteration options, mirroring the scoping knobs of the embedded store.
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub prefix: Vec<u8>,
    pub reverse: bool,
    /// When false, values are not materialized (key-only counting scans).
    pub prefetch_values: bool,
}

/// Callback invoked by the committer thread with the commit outcome.
pub type CommitCallback = Box<dyn FnOnce(StoreResult<()>) + Send + 'static>;

struct CommitTask {
    record: CommitRecord,
    callback: CommitCallback,
}

struct BackingInner {
    /// key → versions, ascending by commit timestamp.
    index: RwLock<BTreeMap<Vec<u8>, Vec<Version>>>,
    log: Option<Mutex<LogWriter>>,
}

impl BackingInner {
    /// Apply one transaction: durable log append first, then publish every
    /// entry to the index at `ts`.
    fn apply(&self, record: CommitRecord) -> StoreResult<()> {
        if let Some(log) = &self.log {
            log.lock().append(&record)?;
        }
        let mut index = self.index.write();
        let ts = record.ts;
        for entry in record.entries {
            Self::insert_version(
                &mut index,
                entry.key,
                Version {
                    ts,
                    user_meta: entry.user_meta,
                    value: entry.value,
                },
            );
        }
        Ok(())
    }

    fn insert_version(index: &mut BTreeMap<Vec<u8>, Vec<Version>>, key: Vec<u8>, version: Version) {
        let versions = index.entry(key).or_default();
        match versions.binary_search_by(|v| v.ts.cmp(&version.ts)) {
            // Same key at the same timestamp: replay/load idempotency.
            Ok(i) => versions[i] = version,
            Err(i) => versions.insert(i, version),
        }
    }
}

/// Newest version visible at `ts`, if any.
fn visible_at(versions: &[Version], ts: u64) -> Option<&Version> {
    versions.iter().rev().find(|v| v.ts <= ts)
}

fn raw_item(key: &[u8], version: &Version, prefetch_values: bool) -> RawKv {
    RawKv {
        key: key.to_vec(),
        value: if prefetch_values {
            version.value.clone()
        } else {
            Vec::new()
        },
        user_meta: version.user_meta,
        ts: version.ts,
    }
}

/// The embedded backing store handle. Cheap to share; all methods take `&self`.
pub struct BackingKv {
    inner: Arc<BackingInner>,
    committer_tx: Mutex<Option<mpsc::SyncSender<CommitTask>>>,
    committer: Mutex<Option<JoinHandle<()>>>,
}

impl BackingKv {
    /// Open the store: replay the commit log from `options.dir`, or start
    /// empty when `in_memory` is set.
    pub fn open(options: &Options) -> StoreResult<Self> {
        let (log, replayed) = if options.in_memory {
            (None, Vec::new())
        } else {
            let (writer, records) = LogWriter::open(&options.dir, options.sync_writes)?;
            (Some(Mutex::new(writer)), records)
        };

        let mut index = BTreeMap::new();
        let mut replayed_rows = 0usize;
        for record in replayed {
            let ts = record.ts;
            for entry in record.entries {
                replayed_rows += 1;
                BackingInner::insert_version(
                    &mut index,
                    entry.key,
                    Version {
                        ts,
                        user_meta: entry.user_meta,
                        value: entry.value,
                    },
                );
            }
        }
        if replayed_rows > 0 {
            tracing::debug!(rows = replayed_rows, "backing log replayed");
        }

        let inner = Arc::new(BackingInner {
            index: RwLock::new(index),
            log,
        });

        let (tx, rx) = mpsc::sync_channel::<CommitTask>(COMMITTER_CHANNEL_CAPACITY);
        let worker_inner = inner.clone();
        let committer = std::thread::Builder::new()
            .name("cachet-committer".into())
            .spawn(move || {
                for task in rx {
                    let result = worker_inner.apply(task.record);
                    (task.callback)(result);
                }
            })
            .map_err(|e| StoreError::Backing(format!("spawn committer: {}", e)))?;

        Ok(Self {
            inner,
            committer_tx: Mutex::new(Some(tx)),
            committer: Mutex::new(Some(committer)),
        })
    }

    /// Begin a write transaction. Dropping it uncommitted discards every
    /// staged entry.
    pub fn write_txn(&self) -> StoreResult<WriteTxn> {
        let tx = self
            .committer_tx
            .lock()
            .clone()
            .ok_or_else(|| StoreError::Backing("store closed".into()))?;
        Ok(WriteTxn {
            inner: self.inner.clone(),
            committer_tx: tx,
            staged: Vec::new(),
        })
    }

    /// Begin a read transaction: a snapshot at `read_ts`.
    pub fn read_txn(&self, read_ts: u64) -> ReadTxn {
        ReadTxn {
            inner: self.inner.clone(),
            read_ts,
        }
    }

    /// Stream every row (all versions up to `ts`, tree nodes included) as
    /// `KvList` batches through `send`, ordered by key then timestamp.
    ///
    /// `parallelism` is accepted as a worker hint for parity with the embedded
    /// store's API; batches are produced sequentially.
    pub fn stream_at(
        &self,
        ts: u64,
        parallelism: usize,
        mut send: impl FnMut(KvList) -> StoreResult<()>,
    ) -> StoreResult<()> {
        tracing::debug!(ts, parallelism, "backing stream started");
        let index = self.inner.index.read();
        let mut batch = Vec::with_capacity(STREAM_BATCH_SIZE);
        for (key, versions) in index.iter() {
            for version in versions.iter().filter(|v| v.ts <= ts) {
                batch.push(raw_item(key, version, true));
                if batch.len() >= STREAM_BATCH_SIZE {
                    send(KvList {
                        kvs: std::mem::take(&mut batch),
                    })?;
                    batch.reserve(STREAM_BATCH_SIZE);
                }
            }
        }
        if !batch.is_empty() {
            send(KvList { kvs: batch })?;
        }
        Ok(())
    }

    /// Create a bulk loader for restore. `parallelism` is a worker hint.
    pub fn loader(&self, parallelism: usize) -> KvLoader {
        tracing::debug!(parallelism, "backing loader created");
        KvLoader {
            inner: self.inner.clone(),
            buffered: Vec::with_capacity(STREAM_BATCH_SIZE),
        }
    }

    /// Diagnostic sizes: (log bytes on disk, approximate index bytes).
    pub fn size(&self) -> (u64, u64) {
        let log_bytes = self
            .inner
            .log
            .as_ref()
            .map(|l| l.lock().size())
            .unwrap_or(0);
        let index = self.inner.index.read();
        let index_bytes: u64 = index
            .iter()
            .map(|(k, versions)| {
                k.len() as u64
                    + versions
                        .iter()
                        .map(|v| v.value.len() as u64 + 9)
                        .sum::<u64>()
            })
            .sum();
        (log_bytes, index_bytes)
    }

    /// Stop the committer thread after draining queued tasks. Idempotent.
    pub fn close(&self) {
        drop(self.committer_tx.lock().take());
        if let Some(handle) = self.committer.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("committer thread panicked during close");
            }
        }
    }

    /// Test hook: overwrite a stored version in place, bypassing the log and
    /// the append-only discipline, to simulate external tampering.
    #[cfg(test)]
    pub(crate) fn raw_overwrite(&self, key: &[u8], ts: u64, value: Vec<u8>) -> bool {
        let mut index = self.inner.index.write();
        if let Some(versions) = index.get_mut(key) {
            if let Some(v) = versions.iter_mut().find(|v| v.ts == ts) {
                v.value = value;
                return true;
            }
        }
        false
    }
}

impl Drop for BackingKv {
    fn drop(&mut self) {
        self.close();
    }
}

/// A write transaction: staged entries become visible atomically at the
/// caller-supplied commit timestamp.
pub struct WriteTxn {
    inner: Arc<BackingInner>,
    committer_tx: mpsc::SyncSender<CommitTask>,
    staged: Vec<LogEntry>,
}

impl WriteTxn {
    /// Read the newest committed version of `key` (staged entries of this
    /// transaction are not visible to it).
    pub fn get(&self, key: &[u8]) -> StoreResult<RawKv> {
        let index = self.inner.index.read();
        index
            .get(key)
            .and_then(|versions| visible_at(versions, SNAPSHOT_LATEST))
            .map(|v| raw_item(key, v, true))
            .ok_or(StoreError::KeyNotFound)
    }

    /// Stage one entry.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>, user_meta: u8) {
        self.staged.push(LogEntry {
            key,
            value,
            user_meta,
        });
    }

    /// Commit synchronously at `ts`.
    pub fn commit_at(self, ts: u64) -> StoreResult<()> {
        self.inner.apply(CommitRecord {
            ts,
            entries: self.staged,
        })
    }

    /// Hand the transaction to the committer thread; `callback` runs there
    /// with the outcome once the commit is applied.
    pub fn commit_at_async(self, ts: u64, callback: CommitCallback) -> StoreResult<()> {
        let task = CommitTask {
            record: CommitRecord {
                ts,
                entries: self.staged,
            },
            callback,
        };
        self.committer_tx
            .send(task)
            .map_err(|_| StoreError::Backing("committer stopped".into()))
    }
}

/// A read snapshot at a fixed timestamp.
pub struct ReadTxn {
    inner: Arc<BackingInner>,
    read_ts: u64,
}

impl ReadTxn {
    /// Newest version of `key` visible at the snapshot timestamp.
    pub fn get(&self, key: &[u8]) -> StoreResult<RawKv> {
        let index = self.inner.index.read();
        index
            .get(key)
            .and_then(|versions| visible_at(versions, self.read_ts))
            .map(|v| raw_item(key, v, true))
            .ok_or(StoreError::KeyNotFound)
    }

    /// Every version of `key` visible at the snapshot, newest first.
    pub fn versions(&self, key: &[u8]) -> StoreResult<Vec<RawKv>> {
        let index = self.inner.index.read();
        let versions: Vec<RawKv> = index
            .get(key)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .filter(|v| v.ts <= self.read_ts)
                    .map(|v| raw_item(key, v, true))
                    .collect()
            })
            .unwrap_or_default();
        if versions.is_empty() {
            return Err(StoreError::KeyNotFound);
        }
        Ok(versions)
    }

    /// Scan the newest visible version of every key in scope, ordered by key.
    pub fn iter(&self, opts: IterOptions) -> Vec<RawKv> {
        let index = self.inner.index.read();
        let mut items: Vec<RawKv> = index
            .range(opts.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&opts.prefix))
            .filter_map(|(k, versions)| {
                visible_at(versions, self.read_ts).map(|v| raw_item(k, v, opts.prefetch_values))
            })
            .collect();
        if opts.reverse {
            items.reverse();
        }
        items
    }

    /// Number of keys with a visible version under `prefix`.
    pub fn count_prefix(&self, prefix: &[u8]) -> u64 {
        let index = self.inner.index.read();
        index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, versions)| visible_at(versions, self.read_ts).is_some())
            .count() as u64
    }

    /// Number of keys with any visible version, tree rows included.
    pub fn count_all(&self) -> u64 {
        let index = self.inner.index.read();
        index
            .values()
            .filter(|versions| visible_at(versions, self.read_ts).is_some())
            .count() as u64
    }
}

/// Bulk loader used by restore: buffers rows and applies them in batches,
/// each batch grouped into one commit record per distinct timestamp.
pub struct KvLoader {
    inner: Arc<BackingInner>,
    buffered: Vec<RawKv>,
}

impl KvLoader {
    pub fn set(&mut self, kv: RawKv) -> StoreResult<()> {
        self.buffered.push(kv);
        if self.buffered.len() >= STREAM_BATCH_SIZE {
            self.flush_buffered()?;
        }
        Ok(())
    }

    /// Flush remaining rows. Must be called exactly once, after the input
    /// stream is exhausted.
    pub fn finish(mut self) -> StoreResult<()> {
        self.flush_buffered()
    }

    fn flush_buffered(&mut self) -> StoreResult<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let mut by_ts: BTreeMap<u64, Vec<LogEntry>> = BTreeMap::new();
        for kv in self.buffered.drain(..) {
            by_ts.entry(kv.ts).or_default().push(LogEntry {
                key: kv.key,
                value: kv.value,
                user_meta: kv.user_meta,
            });
        }
        for (ts, entries) in by_ts {
            self.inner.apply(CommitRecord { ts, entries })?;
        }
        Ok(())
    }
}
