use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved first byte of every Merkle tree node key. User keys whose first
/// byte equals this value are rejected. Fixed forever: changing it would
/// silently re-partition the persisted key space.
pub const TS_PREFIX: u8 = 0x00;

/// User-meta bit marking a row whose value is another key rather than user
/// data. All other bits are reserved and must be zero.
pub const BIT_REFERENCE: u8 = 0x01;

/// Size in bytes of every node hash in the tree.
pub const HASH_SIZE: usize = 32;

/// A key-value pair submitted for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KvPair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A committed row: the key, its value and the zero-based insertion-order
/// index (commit timestamp minus one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub index: u64,
}

/// The current tree commitment: the index of the last committed leaf and the
/// Merkle root over all of them. The zero value stands for an empty store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Root {
    pub index: u64,
    pub hash: [u8; HASH_SIZE],
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root:{}:", self.index)?;
        for b in &self.hash {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A raw backing-store row as carried by the dump/restore stream: the exact
/// persisted bytes plus the commit timestamp and user-meta flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawKv {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
    pub ts: u64,
}

/// One batch of raw rows on the dump/restore channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvList {
    pub kvs: Vec<RawKv>,
}

impl KvList {
    pub fn len(&self) -> usize {
        self.kvs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }
}

/// A node in the diagnostic tree snapshot produced by `get_tree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Persistence address of the node: `[TS_PREFIX, layer, index BE]`.
    pub key: Vec<u8>,
    pub hash: [u8; HASH_SIZE],
    /// For layer-0 nodes: the user key decoded from the stored leaf reference.
    pub ref_key: Option<Vec<u8>>,
    /// True when the node was served from the in-memory cache rather than disk.
    pub cache: bool,
    /// True for the first node of the top layer.
    pub root: bool,
}

/// One layer of the diagnostic tree snapshot, ordered by node index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeLayer {
    pub nodes: Vec<TreeNode>,
}

/// Layered diagnostic snapshot of the Merkle tree, bottom-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub layers: Vec<TreeLayer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_zero_value() {
        let root = Root::default();
        assert_eq!(root.index, 0);
        assert_eq!(root.hash, [0u8; HASH_SIZE]);
    }

    #[test]
    fn test_root_display() {
        let root = Root {
            index: 3,
            hash: [0xab; HASH_SIZE],
        };
        let s = root.to_string();
        assert!(s.starts_with("root:3:abab"));
    }

    #[test]
    fn test_kv_list_empty() {
        let list = KvList::default();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
