//! The outward-facing storage engine.
//!
//! Combines the backing store and the tree store. Every write follows one
//! protocol: validate, stage in a backing transaction, reserve tree leaves,
//! commit the transaction at the reserved timestamp, then publish the leaves
//! on success or discard them on failure. The commit step runs synchronously
//! by default or on the backing store's committer thread when asked to; a
//! wait-group tracks outstanding completions and `close` drains it.

use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use cachet_common::config::Options;
use cachet_common::error::{StoreError, StoreResult};
use cachet_common::types::{Entry, KvList, KvPair, Root, Tree, BIT_REFERENCE, TS_PREFIX};

use crate::backing::{BackingKv, IterOptions, WriteTxn, SNAPSHOT_LATEST};
use crate::digest::leaf_digest;
use crate::schema::{
    check_key, check_reference, check_set, decode_ref_tree_key, set_key, set_prefix, tree_key,
};
use crate::tree::{TreeEntry, TreeStore};

/// Per-operation write configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Run the tree commit/discard step on the backing store's completion
    /// thread instead of before the call returns. The caller then observes
    /// the assigned index before tree durability is final.
    pub async_commit: bool,
}

impl WriteOptions {
    pub fn async_commit(mut self, yes: bool) -> Self {
        self.async_commit = yes;
        self
    }
}

/// Counts outstanding async completions; `close` blocks until it drains.
struct WaitGroup {
    count: Mutex<usize>,
    drained: Condvar,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

/// The engine. Multiple stores may coexist, each bound to its own directory;
/// all entity lifetimes are bounded by `close`.
pub struct Store {
    db: Arc<BackingKv>,
    tree: Arc<TreeStore>,
    pending: Arc<WaitGroup>,
    stream_parallelism: usize,
}

impl Store {
    /// Open the engine against a directory (or in memory). The backing
    /// version-retention tunable is forced to keep everything: immutability
    /// is not negotiable here.
    pub fn open(options: Options) -> StoreResult<Self> {
        let mut options = options;
        options.num_versions_to_keep = i64::MAX;

        let db = Arc::new(BackingKv::open(&options)?);
        let tree = Arc::new(TreeStore::new(db.clone(), options.tree_cache_capacity));
        tree.load_tree_state()?;

        tracing::info!(dir = %options.dir.display(), in_memory = options.in_memory, "store opened");
        Ok(Self {
            db,
            tree,
            pending: Arc::new(WaitGroup::new()),
            stream_parallelism: options.stream_parallelism,
        })
    }

    /// Insert one key-value pair. Returns the assigned insertion-order index.
    pub fn set(&self, pair: KvPair, opts: WriteOptions) -> StoreResult<u64> {
        check_key(&pair.key)?;

        let mut txn = self.db.write_txn()?;
        txn.set(pair.key.clone(), pair.value.clone(), 0);

        let entry = self.tree.new_entry(&pair.key, &pair.value)?;
        let index = entry.index();
        self.finish_commit(txn, vec![entry], opts)?;
        Ok(index)
    }

    /// Insert a batch atomically. Returns the index of the last entry.
    pub fn set_batch(&self, pairs: Vec<KvPair>, opts: WriteOptions) -> StoreResult<u64> {
        if pairs.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        for pair in &pairs {
            check_key(&pair.key)?;
        }

        let mut txn = self.db.write_txn()?;
        for pair in &pairs {
            txn.set(pair.key.clone(), pair.value.clone(), 0);
        }

        let entries = self.tree.new_batch(&pairs)?;
        let index = entries.last().expect("non-empty batch").index();
        self.finish_commit(txn, entries, opts)?;
        Ok(index)
    }

    /// Create a symbolic alias for an existing key. Reading the alias returns
    /// the referent's current row.
    pub fn reference(&self, key: &[u8], alias: &[u8], opts: WriteOptions) -> StoreResult<u64> {
        check_key(key)?;
        check_reference(alias)?;

        let mut txn = self.db.write_txn()?;
        // The referent must already exist; no index is consumed otherwise.
        let referent = txn.get(key)?;

        txn.set(alias.to_vec(), referent.key.clone(), BIT_REFERENCE);
        let entry = self.tree.new_entry(alias, &referent.key)?;
        let index = entry.index();
        self.finish_commit(txn, vec![entry], opts)?;
        Ok(index)
    }

    /// Add an existing key to a sorted set under `score`. The member row is a
    /// reference entry; prefix iteration over the set yields members in
    /// ascending (score, key) order.
    pub fn zadd(
        &self,
        set: &[u8],
        score: f64,
        key: &[u8],
        opts: WriteOptions,
    ) -> StoreResult<u64> {
        check_key(key)?;
        check_set(set)?;

        let mut txn = self.db.write_txn()?;
        let referent = txn.get(key)?;

        let member = set_key(set, score, key);
        txn.set(member.clone(), referent.key.clone(), BIT_REFERENCE);
        let entry = self.tree.new_entry(&member, &referent.key)?;
        let index = entry.index();
        self.finish_commit(txn, vec![entry], opts)?;
        Ok(index)
    }

    /// Fetch the current row for `key`, transparently resolving reference
    /// entries to their referent's latest row.
    pub fn get(&self, key: &[u8]) -> StoreResult<Entry> {
        check_key(key)?;
        let read = self.db.read_txn(SNAPSHOT_LATEST);
        let item = read.get(key)?;

        if item.user_meta & BIT_REFERENCE == BIT_REFERENCE {
            if let Ok(referent) = read.get(&item.value) {
                return Ok(Entry {
                    key: item.value,
                    value: referent.value,
                    index: referent.ts - 1,
                });
            }
        }
        Ok(Entry {
            key: item.key,
            value: item.value,
            index: item.ts - 1,
        })
    }

    /// The exact historical row at insertion-order `index`, independent of
    /// any later writes of the same key.
    pub fn by_index(&self, index: u64) -> StoreResult<Entry> {
        let read_ts = index.checked_add(1).ok_or(StoreError::IndexNotFound)?;
        self.item_at(read_ts)
    }

    /// Resolve a commit timestamp to its row via the tree's leaf reference,
    /// re-checking the recorded digest against the stored value.
    fn item_at(&self, read_ts: u64) -> StoreResult<Entry> {
        let index = read_ts - 1;
        if read_ts > self.tree.width() {
            return Err(StoreError::IndexNotFound);
        }

        let ref_bytes = match self.tree.leaf_ref(index) {
            Some(bytes) => bytes,
            None => {
                let read = self.db.read_txn(SNAPSHOT_LATEST);
                read.get(&tree_key(0, index))
                    .map_err(|e| match e {
                        StoreError::KeyNotFound => StoreError::IndexNotFound,
                        other => other,
                    })?
                    .value
            }
        };
        let (hash, key) = decode_ref_tree_key(&ref_bytes)?;

        let read = self.db.read_txn(SNAPSHOT_LATEST);
        let item = read
            .versions(&key)?
            .into_iter()
            .find(|v| v.ts == read_ts)
            .ok_or(StoreError::KeyNotFound)?;

        // Guard the insertion-order binding: tampering with the stored row
        // breaks the digest recorded in the leaf.
        if leaf_digest(index, &key, &item.value) != hash {
            return Err(StoreError::InconsistentDigest);
        }
        Ok(Entry {
            key,
            value: item.value,
            index,
        })
    }

    /// Every committed version of `key`, newest first. Alias rows created by
    /// `reference`/`zadd` are not part of a key's history.
    pub fn history(&self, key: &[u8]) -> StoreResult<Vec<Entry>> {
        check_key(key)?;
        let read = self.db.read_txn(SNAPSHOT_LATEST);
        let versions = match read.versions(key) {
            Ok(versions) => versions,
            Err(StoreError::KeyNotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(versions
            .into_iter()
            .map(|v| Entry {
                key: key.to_vec(),
                value: v.value,
                index: v.ts - 1,
            })
            .collect())
    }

    /// Number of keys under `prefix`. The prefix must be non-empty and
    /// outside the reserved key space; values are not prefetched.
    pub fn count(&self, prefix: &[u8]) -> StoreResult<u64> {
        if prefix.is_empty() || prefix[0] == TS_PREFIX {
            return Err(StoreError::InvalidKeyPrefix);
        }
        Ok(self.db.read_txn(SNAPSHOT_LATEST).count_prefix(prefix))
    }

    /// Number of every stored key, tree-node rows included. Diagnostic.
    pub fn count_all(&self) -> u64 {
        self.db.read_txn(SNAPSHOT_LATEST).count_all()
    }

    /// Members of a sorted set in ascending (score, key) order, resolved to
    /// their referents' current rows.
    pub fn zscan(&self, set: &[u8]) -> StoreResult<Vec<Entry>> {
        check_set(set)?;
        let read = self.db.read_txn(SNAPSHOT_LATEST);
        let members = read.iter(IterOptions {
            prefix: set_prefix(set),
            reverse: false,
            prefetch_values: true,
        });
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            if let Ok(referent) = read.get(&member.value) {
                entries.push(Entry {
                    key: member.value,
                    value: referent.value,
                    index: referent.ts - 1,
                });
            }
        }
        Ok(entries)
    }

    /// The current tree commitment; the zero value while nothing is committed.
    pub fn current_root(&self) -> StoreResult<Root> {
        let (width, hash) = self.tree.width_and_root()?;
        if width == 0 {
            return Ok(Root::default());
        }
        Ok(Root {
            index: width - 1,
            hash,
        })
    }

    /// Probe the store: healthy when a read either succeeds or reports a
    /// missing key.
    pub fn health_check(&self) -> bool {
        match self.get(&[0xFF]) {
            Ok(_) => true,
            Err(e) => e.is_not_found(),
        }
    }

    /// Export every backing row into `sender` as `KvList` batches. The tree
    /// is flushed and locked for the duration; the channel closes when the
    /// stream completes (or immediately when nothing was ever committed).
    pub fn dump(&self, sender: mpsc::SyncSender<KvList>) -> StoreResult<()> {
        let result = self.tree.dump(self.stream_parallelism, |list| {
            sender
                .send(list)
                .map_err(|_| StoreError::Backing("dump receiver dropped".into()))
        });
        drop(sender);
        result
    }

    /// Rebuild the store from a dump stream: bulk-load every batch until the
    /// channel closes, then recover the tree state from the loaded nodes.
    /// Returns the recovered commit timestamp.
    pub fn restore(&self, receiver: mpsc::Receiver<KvList>) -> StoreResult<u64> {
        let ts = self.tree.restore(receiver.into_iter(), self.stream_parallelism)?;
        tracing::info!(ts, "store restored");
        Ok(ts)
    }

    /// Layered diagnostic snapshot of the Merkle tree, disk and cache merged.
    pub fn get_tree(&self) -> StoreResult<Tree> {
        self.tree.get_tree()
    }

    /// Block until every outstanding asynchronous commit has completed.
    pub fn wait(&self) {
        self.pending.wait();
    }

    /// Drain async work and persist all frozen tree nodes.
    pub fn flush_to_disk(&self) -> StoreResult<()> {
        self.pending.wait();
        self.tree.flush()
    }

    /// Backing store sizes: (log bytes, index bytes). Diagnostic.
    pub fn db_size(&self) -> (u64, u64) {
        self.db.size()
    }

    /// Drain outstanding commits, flush the tree and close the backing store.
    pub fn close(&self) -> StoreResult<()> {
        self.pending.wait();
        self.tree.close()?;
        self.db.close();
        tracing::info!("store closed");
        Ok(())
    }

    /// Shared commit tail of every write: commit the backing transaction at
    /// the last reserved timestamp, then publish or discard the reservations.
    fn finish_commit(
        &self,
        txn: WriteTxn,
        entries: Vec<TreeEntry>,
        opts: WriteOptions,
    ) -> StoreResult<()> {
        let ts = entries.last().expect("at least one reservation").ts;

        if opts.async_commit {
            self.pending.add(1);
            let tree = self.tree.clone();
            let pending = self.pending.clone();
            let first = entries.first().cloned();
            let dispatched = txn.commit_at_async(
                ts,
                Box::new(move |result| {
                    match result {
                        Ok(()) => {
                            for entry in &entries {
                                tree.commit(entry);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(ts, error = %e, "async commit failed, discarding");
                            for entry in &entries {
                                tree.discard(entry);
                            }
                        }
                    }
                    pending.done();
                }),
            );
            if let Err(e) = dispatched {
                // Never dispatched: the callback will not run, so roll the
                // reservations back here. Discarding the first truncates all.
                if let Some(first) = first {
                    self.tree.discard(&first);
                }
                self.pending.done();
                return Err(e);
            }
            Ok(())
        } else {
            match txn.commit_at(ts) {
                Ok(()) => {
                    for entry in &entries {
                        self.tree.commit(entry);
                    }
                    Ok(())
                }
                Err(e) => {
                    for entry in &entries {
                        self.tree.discard(entry);
                    }
                    Err(e)
                }
            }
        }
    }

    /// Test hook: tamper with a stored version behind the engine's back.
    #[cfg(test)]
    pub(crate) fn corrupt_row(&self, key: &[u8], ts: u64, value: Vec<u8>) -> bool {
        self.db.raw_overwrite(key, ts, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_group_drains() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);
        let inner = wg.clone();
        let handle = std::thread::spawn(move || {
            inner.done();
            inner.done();
        });
        wg.wait();
        handle.join().unwrap();
        wg.wait(); // idempotent on an empty group
    }
}
