//! The append-only Merkle tree store.
//!
//! Maintains, per level, the ordered sequence of 32-byte node hashes over the
//! committed leaves. New leaves are reserved in memory, cascaded upward as
//! pairs complete, and only become visible (counted in the width, reachable
//! from the root) once the matching backing-store commit lands. Frozen nodes
//! are persisted under the reserved `TS_PREFIX` key space and evicted from the
//! caches; the root is assembled at query time from the frozen-subtree
//! decomposition of the current width.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cachet_common::error::{StoreError, StoreResult};
use cachet_common::types::{KvList, KvPair, Tree, TreeLayer, TreeNode, HASH_SIZE};

use crate::backing::{BackingKv, IterOptions, SNAPSHOT_LATEST};
use crate::digest::{leaf_digest, node_digest};
use crate::schema::{decode_ref_tree_key, ref_tree_key, tree_key, tree_layer_prefix};

/// Upper bound on tree depth scanned during recovery and diagnostics.
const MAX_TREE_LAYERS: u8 = 128;

/// Handle for one reserved leaf: the commit timestamp it was reserved at, the
/// leaf hash, and the encoded leaf reference (hash ∥ user key).
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub ts: u64,
    pub hash: [u8; HASH_SIZE],
    pub ref_key: Vec<u8>,
}

impl TreeEntry {
    /// The public insertion-order index this reservation maps to.
    pub fn index(&self) -> u64 {
        self.ts - 1
    }
}

struct TreeState {
    /// Next commit timestamp to hand to the backing store.
    w: u64,
    /// Highest committed timestamp; equals the committed leaf count (width).
    ts: u64,
    /// Per-layer cache of nodes not yet persisted, position → hash.
    caches: Vec<BTreeMap<u64, [u8; HASH_SIZE]>>,
    /// Lowest position still resident in `caches[l]`; below it, disk only.
    c_pos: Vec<u64>,
    /// Layer-0 leaf references (hash ∥ key) for recent leaves; spares
    /// per-index reads the disk seek. Retained past flush, evicted by capacity.
    rcache0: BTreeMap<u64, Vec<u8>>,
}

impl TreeState {
    fn ensure_layer(&mut self, layer: usize) {
        while self.caches.len() <= layer {
            self.caches.push(BTreeMap::new());
            self.c_pos.push(0);
        }
    }
}

/// The tree store. All state sits behind one reader-writer lock: reservations
/// and commits take it briefly, width/root queries share it, flush and
/// recovery hold it for the duration.
pub struct TreeStore {
    db: Arc<BackingKv>,
    capacity: usize,
    state: RwLock<TreeState>,
}

impl TreeStore {
    pub fn new(db: Arc<BackingKv>, capacity: usize) -> Self {
        Self {
            db,
            capacity,
            state: RwLock::new(TreeState {
                w: 1,
                ts: 0,
                caches: Vec::new(),
                c_pos: Vec::new(),
                rcache0: BTreeMap::new(),
            }),
        }
    }

    /// Reserve one leaf for `(key, value)`. The leaf hash and its completed
    /// ancestors go into the caches; nothing touches disk yet.
    pub fn new_entry(&self, key: &[u8], value: &[u8]) -> StoreResult<TreeEntry> {
        let mut state = self.state.write();
        let entry = self.append_locked(&mut state, key, value)?;
        self.maybe_evict_locked(&mut state)?;
        Ok(entry)
    }

    /// Reserve one leaf per pair, in list order; the returned timestamps are
    /// consecutive.
    pub fn new_batch(&self, pairs: &[KvPair]) -> StoreResult<Vec<TreeEntry>> {
        let mut state = self.state.write();
        let mut entries = Vec::with_capacity(pairs.len());
        for pair in pairs {
            entries.push(self.append_locked(&mut state, &pair.key, &pair.value)?);
        }
        self.maybe_evict_locked(&mut state)?;
        Ok(entries)
    }

    /// Publish a reservation: the width becomes `entry.ts`. Pure in-memory
    /// state change; persistence happens on a later flush.
    pub fn commit(&self, entry: &TreeEntry) {
        let mut state = self.state.write();
        if entry.ts <= state.ts {
            tracing::warn!(ts = entry.ts, width = state.ts, "tree commit below width ignored");
            return;
        }
        state.ts = entry.ts;
    }

    /// Roll back every uncommitted reservation at or above `entry`:
    /// truncates each level back to the handle and rewinds the timestamp
    /// counter.
    pub fn discard(&self, entry: &TreeEntry) {
        let mut state = self.state.write();
        if entry.ts <= state.ts {
            tracing::warn!(ts = entry.ts, width = state.ts, "tree discard below width ignored");
            return;
        }
        if entry.ts >= state.w {
            return; // nothing reserved at or above this handle
        }
        let keep_leaves = entry.ts - 1;
        for layer in 0..state.caches.len() {
            let keep = keep_leaves >> layer;
            state.caches[layer].split_off(&keep);
        }
        state.rcache0.split_off(&keep_leaves);
        state.w = entry.ts;
    }

    /// Number of committed leaves.
    pub fn width(&self) -> u64 {
        self.state.read().ts
    }

    /// Next commit timestamp to be handed out.
    pub fn next_ts(&self) -> u64 {
        self.state.read().w
    }

    /// Merkle root over the committed width; the zero hash for an empty tree.
    pub fn root(&self) -> StoreResult<[u8; HASH_SIZE]> {
        let state = self.state.read();
        self.root_locked(&state)
    }

    /// Width and root read under one lock acquisition, so the pair is
    /// consistent even with writers running.
    pub fn width_and_root(&self) -> StoreResult<(u64, [u8; HASH_SIZE])> {
        let state = self.state.read();
        Ok((state.ts, self.root_locked(&state)?))
    }

    /// The stored leaf reference (hash ∥ key) for `index`, if still cached.
    pub fn leaf_ref(&self, index: u64) -> Option<Vec<u8>> {
        self.state.read().rcache0.get(&index).cloned()
    }

    /// Persist every committed-but-unpersisted node and advance the resident
    /// floor past the flushed range.
    pub fn flush(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        self.flush_locked(&mut state)
    }

    /// Recover width and cache floors from the persisted node keys. Used on
    /// open and after a bulk restore.
    pub fn load_tree_state(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        self.load_tree_state_locked(&mut state)
    }

    fn load_tree_state_locked(&self, state: &mut TreeState) -> StoreResult<()> {
        state.caches.clear();
        state.c_pos.clear();
        state.rcache0.clear();

        let read = self.db.read_txn(SNAPSHOT_LATEST);
        let mut width = 0u64;
        for layer in 0..MAX_TREE_LAYERS {
            let count = read.count_prefix(&tree_layer_prefix(layer));
            if count == 0 {
                break;
            }
            state.caches.push(BTreeMap::new());
            state.c_pos.push(count);
            if layer == 0 {
                width = count;
            }
        }
        state.ts = width;
        state.w = width + 1;
        tracing::debug!(width, layers = state.caches.len(), "tree state loaded");
        Ok(())
    }

    /// Export every backing row as `KvList` batches through `send`, with the
    /// tree locked exclusively so the stream is a consistent cut: flush first,
    /// then stream at the next unassigned timestamp. An empty tree skips the
    /// stream entirely.
    pub fn dump(
        &self,
        parallelism: usize,
        send: impl FnMut(KvList) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        self.flush_locked(&mut state)?;
        if state.ts == 0 {
            return Ok(());
        }
        self.db.stream_at(state.w, parallelism, send)
    }

    /// Bulk-load `KvList` batches into the backing store under the exclusive
    /// tree lock, draining the input to its end, then recompute the tree state
    /// from the persisted nodes. Returns the recovered commit timestamp.
    pub fn restore(
        &self,
        lists: impl IntoIterator<Item = KvList>,
        parallelism: usize,
    ) -> StoreResult<u64> {
        let mut state = self.state.write();
        let mut loader = self.db.loader(parallelism);
        for list in lists {
            for kv in list.kvs {
                loader.set(kv)?;
            }
        }
        loader.finish()?;
        self.load_tree_state_locked(&mut state)?;
        Ok(state.ts)
    }

    /// Flush and release. The backing store itself is closed by the engine.
    pub fn close(&self) -> StoreResult<()> {
        self.flush()
    }

    /// Layered diagnostic snapshot: the persisted layers merged with the
    /// in-memory cache layers (cache wins on a shared index), leaf references
    /// decoded, the top layer's first node marked as the root.
    pub fn get_tree(&self) -> StoreResult<Tree> {
        let state = self.state.write();
        let read = self.db.read_txn(SNAPSHOT_LATEST);

        let mut layers: Vec<TreeLayer> = Vec::new();
        for layer in 0..MAX_TREE_LAYERS {
            // position → node, disk first, then cache overrides.
            let mut merged: BTreeMap<u64, TreeNode> = BTreeMap::new();

            for item in read.iter(IterOptions {
                prefix: tree_layer_prefix(layer).to_vec(),
                reverse: false,
                prefetch_values: true,
            }) {
                let position = node_position(&item.key);
                let (hash, ref_key) = split_node_value(layer, &item.value)?;
                merged.insert(
                    position,
                    TreeNode {
                        key: item.key,
                        hash,
                        ref_key,
                        cache: false,
                        root: false,
                    },
                );
            }

            if let Some(cache) = state.caches.get(layer as usize) {
                for (&position, hash) in cache {
                    let ref_key = if layer == 0 {
                        state
                            .rcache0
                            .get(&position)
                            .and_then(|raw| decode_ref_tree_key(raw).ok())
                            .map(|(_, key)| key)
                    } else {
                        None
                    };
                    merged.insert(
                        position,
                        TreeNode {
                            key: tree_key(layer, position),
                            hash: *hash,
                            ref_key,
                            cache: true,
                            root: false,
                        },
                    );
                }
            }

            if merged.is_empty() {
                break;
            }
            layers.push(TreeLayer {
                nodes: merged.into_values().collect(),
            });
        }

        if let Some(top) = layers.last_mut() {
            if let Some(first) = top.nodes.first_mut() {
                first.root = true;
            }
        }
        Ok(Tree { layers })
    }

    fn append_locked(
        &self,
        state: &mut TreeState,
        key: &[u8],
        value: &[u8],
    ) -> StoreResult<TreeEntry> {
        let ts = state.w;
        state.w += 1;
        let index = ts - 1;

        let hash = leaf_digest(index, key, value);
        let ref_key = ref_tree_key(&hash, key);

        state.ensure_layer(0);
        state.caches[0].insert(index, hash);
        state.rcache0.insert(index, ref_key.clone());

        // Cascade: each time the new node closes a pair, its parent freezes.
        let mut layer = 0usize;
        let mut position = index;
        let mut node = hash;
        while position & 1 == 1 {
            let left = self.node_hash(state, layer as u8, position - 1)?;
            node = node_digest(&left, &node);
            position >>= 1;
            layer += 1;
            state.ensure_layer(layer);
            state.caches[layer].insert(position, node);
        }

        Ok(TreeEntry { ts, hash, ref_key })
    }

    fn node_hash(&self, state: &TreeState, layer: u8, position: u64) -> StoreResult<[u8; HASH_SIZE]> {
        if let Some(cache) = state.caches.get(layer as usize) {
            if let Some(hash) = cache.get(&position) {
                return Ok(*hash);
            }
        }
        let read = self.db.read_txn(SNAPSHOT_LATEST);
        let item = read.get(&tree_key(layer, position)).map_err(|e| match e {
            StoreError::KeyNotFound => {
                StoreError::Corrupted(format!("missing tree node ({}, {})", layer, position))
            }
            other => other,
        })?;
        let (hash, _) = split_node_value(layer, &item.value)?;
        Ok(hash)
    }

    fn root_locked(&self, state: &TreeState) -> StoreResult<[u8; HASH_SIZE]> {
        let width = state.ts;
        if width == 0 {
            return Ok([0u8; HASH_SIZE]);
        }
        // Decompose the width into complete subtrees, one per set bit, and
        // fold them right to left; lone subtree roots are promoted unhashed.
        let mut acc: Option<[u8; HASH_SIZE]> = None;
        let mut layer = 0u8;
        let mut remaining = width;
        while remaining > 0 {
            if remaining & 1 == 1 {
                let node = self.node_hash(state, layer, remaining - 1)?;
                acc = Some(match acc {
                    None => node,
                    Some(right) => node_digest(&node, &right),
                });
            }
            remaining >>= 1;
            layer += 1;
        }
        Ok(acc.expect("non-zero width yields at least one subtree"))
    }

    fn flush_locked(&self, state: &mut TreeState) -> StoreResult<()> {
        if state.ts == 0 {
            return Ok(());
        }
        let mut txn = self.db.write_txn()?;
        let mut flushed = 0usize;

        for layer in 0..state.caches.len() {
            // Only committed positions freeze to disk; reservations beyond
            // the width stay cached until their commit or discard.
            let bound = state.ts >> layer;
            let kept = state.caches[layer].split_off(&bound);
            let committed = std::mem::replace(&mut state.caches[layer], kept);
            for (position, hash) in &committed {
                let value = if layer == 0 {
                    state.rcache0.get(position).cloned().ok_or_else(|| {
                        StoreError::Corrupted(format!("leaf reference missing at {}", position))
                    })?
                } else {
                    hash.to_vec()
                };
                txn.set(tree_key(layer as u8, *position), value, 0);
                flushed += 1;
            }
            if state.c_pos[layer] < bound {
                state.c_pos[layer] = bound;
            }
        }

        if flushed == 0 {
            return Ok(());
        }
        txn.commit_at(state.ts)?;
        tracing::debug!(nodes = flushed, width = state.ts, "tree flushed");

        // The leaf-reference cache survives the flush for recent reads, but
        // is bounded: evict the oldest persisted positions past capacity.
        while state.rcache0.len() > self.capacity {
            let oldest = state.rcache0.keys().next().copied();
            match oldest {
                Some(pos) if pos < state.c_pos[0] => {
                    state.rcache0.remove(&pos);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn maybe_evict_locked(&self, state: &mut TreeState) -> StoreResult<()> {
        match state.caches.first() {
            Some(leaves) if leaves.len() > self.capacity => self.flush_locked(state),
            _ => Ok(()),
        }
    }
}

fn node_position(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[2..10]);
    u64::from_be_bytes(buf)
}

/// Split a persisted node value into its hash and, for layer 0, the trailing
/// user key of the leaf reference.
fn split_node_value(layer: u8, value: &[u8]) -> StoreResult<([u8; HASH_SIZE], Option<Vec<u8>>)> {
    if layer == 0 {
        let (hash, key) = decode_ref_tree_key(value)?;
        Ok((hash, Some(key)))
    } else {
        if value.len() != HASH_SIZE {
            return Err(StoreError::Corrupted(format!(
                "inner node value of {} bytes",
                value.len()
            )));
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(value);
        Ok((hash, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::root_of;
    use cachet_common::config::Options;

    fn tree_with_capacity(capacity: usize) -> TreeStore {
        let db = Arc::new(BackingKv::open(&Options::new("unused").in_memory(true)).unwrap());
        TreeStore::new(db, capacity)
    }

    fn tree() -> TreeStore {
        tree_with_capacity(1 << 20)
    }

    fn put(t: &TreeStore, key: &[u8], value: &[u8]) -> TreeEntry {
        let entry = t.new_entry(key, value).unwrap();
        t.commit(&entry);
        entry
    }

    #[test]
    fn test_empty_tree() {
        let t = tree();
        assert_eq!(t.width(), 0);
        assert_eq!(t.root().unwrap(), [0u8; HASH_SIZE]);
    }

    #[test]
    fn test_single_leaf_root_is_leaf_digest() {
        let t = tree();
        let entry = put(&t, b"a", b"1");
        assert_eq!(entry.ts, 1);
        assert_eq!(t.width(), 1);
        assert_eq!(t.root().unwrap(), leaf_digest(0, b"a", b"1"));
    }

    #[test]
    fn test_root_matches_reference_for_every_width() {
        let t = tree();
        let mut leaves = Vec::new();
        for i in 0..33u64 {
            let key = format!("key-{}", i).into_bytes();
            let value = format!("value-{}", i).into_bytes();
            put(&t, &key, &value);
            leaves.push(leaf_digest(i, &key, &value));
            assert_eq!(t.width(), i + 1);
            assert_eq!(t.root().unwrap(), root_of(&leaves), "width {}", i + 1);
        }
    }

    #[test]
    fn test_uncommitted_entry_is_invisible() {
        let t = tree();
        put(&t, b"a", b"1");
        let reserved = t.new_entry(b"b", b"2").unwrap();
        assert_eq!(t.width(), 1);
        assert_eq!(t.root().unwrap(), leaf_digest(0, b"a", b"1"));
        t.commit(&reserved);
        assert_eq!(t.width(), 2);
    }

    #[test]
    fn test_discard_truncates_reservation() {
        let t = tree();
        let mut leaves = Vec::new();
        for i in 0..3u64 {
            let key = format!("k{}", i).into_bytes();
            put(&t, &key, b"v");
            leaves.push(leaf_digest(i, &key, b"v"));
        }
        let reserved = t.new_entry(b"doomed", b"x").unwrap();
        t.discard(&reserved);
        assert_eq!(t.width(), 3);
        assert_eq!(t.root().unwrap(), root_of(&leaves));

        // The freed timestamp is reused by the next reservation.
        let next = t.new_entry(b"k3", b"v").unwrap();
        assert_eq!(next.ts, reserved.ts);
        t.commit(&next);
        leaves.push(leaf_digest(3, b"k3", b"v"));
        assert_eq!(t.root().unwrap(), root_of(&leaves));
    }

    #[test]
    fn test_batch_reserves_consecutive_timestamps() {
        let t = tree();
        let pairs: Vec<KvPair> = (0..5u8)
            .map(|i| KvPair::new(vec![b'k', i + b'0'], vec![i]))
            .collect();
        let entries = t.new_batch(&pairs).unwrap();
        assert_eq!(entries.len(), 5);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.ts, i as u64 + 1);
        }
        for e in &entries {
            t.commit(e);
        }
        assert_eq!(t.width(), 5);
    }

    #[test]
    fn test_flush_then_root_reads_from_disk() {
        let t = tree();
        let mut leaves = Vec::new();
        for i in 0..7u64 {
            let key = format!("k{}", i).into_bytes();
            put(&t, &key, b"v");
            leaves.push(leaf_digest(i, &key, b"v"));
        }
        t.flush().unwrap();
        assert_eq!(t.root().unwrap(), root_of(&leaves));
        // Appending after a flush pulls frozen siblings back from disk.
        put(&t, b"k7", b"v");
        leaves.push(leaf_digest(7, b"k7", b"v"));
        assert_eq!(t.root().unwrap(), root_of(&leaves));
    }

    #[test]
    fn test_capacity_overflow_flushes_oldest() {
        let t = tree_with_capacity(4);
        let mut leaves = Vec::new();
        for i in 0..16u64 {
            let key = format!("k{:02}", i).into_bytes();
            put(&t, &key, b"v");
            leaves.push(leaf_digest(i, &key, b"v"));
        }
        assert_eq!(t.root().unwrap(), root_of(&leaves));
    }

    #[test]
    fn test_load_tree_state_recovers_width() {
        let db = Arc::new(BackingKv::open(&Options::new("unused").in_memory(true)).unwrap());
        let mut leaves = Vec::new();
        {
            let t = TreeStore::new(db.clone(), 1 << 20);
            for i in 0..6u64 {
                let key = format!("k{}", i).into_bytes();
                put(&t, &key, b"v");
                leaves.push(leaf_digest(i, &key, b"v"));
            }
            t.close().unwrap();
        }
        let t = TreeStore::new(db, 1 << 20);
        t.load_tree_state().unwrap();
        assert_eq!(t.width(), 6);
        assert_eq!(t.next_ts(), 7);
        assert_eq!(t.root().unwrap(), root_of(&leaves));
    }

    #[test]
    fn test_leaf_ref_cache_hit() {
        let t = tree();
        let entry = put(&t, b"a", b"1");
        let cached = t.leaf_ref(entry.index()).unwrap();
        let (hash, key) = decode_ref_tree_key(&cached).unwrap();
        assert_eq!(hash, entry.hash);
        assert_eq!(key, b"a");
    }

    #[test]
    fn test_get_tree_marks_root_and_cache() {
        let t = tree();
        put(&t, b"a", b"1");
        put(&t, b"b", b"2");
        let snapshot = t.get_tree().unwrap();
        assert_eq!(snapshot.layers.len(), 2);
        assert_eq!(snapshot.layers[0].nodes.len(), 2);
        assert!(snapshot.layers[0].nodes.iter().all(|n| n.cache));
        assert_eq!(
            snapshot.layers[0].nodes[0].ref_key.as_deref(),
            Some(b"a".as_slice())
        );
        let top = snapshot.layers.last().unwrap();
        assert!(top.nodes[0].root);

        t.flush().unwrap();
        let snapshot = t.get_tree().unwrap();
        assert!(snapshot.layers[0].nodes.iter().all(|n| !n.cache));
        assert_eq!(
            snapshot.layers[0].nodes[1].ref_key.as_deref(),
            Some(b"b".as_slice())
        );
    }
}
