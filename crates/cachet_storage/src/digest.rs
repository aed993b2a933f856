//! The fixed Merkle combiner.
//!
//! Leaf and internal hashes are domain-separated SHA-256 in the RFC 6962
//! shape. The exact byte layout is part of the persisted format and must
//! never change: every stored node hash and every exported root commits to it.

use cachet_common::types::HASH_SIZE;
use sha2::{Digest, Sha256};

/// Domain-separation prefix for leaf hashes.
pub const LEAF_PREFIX: u8 = 0x00;

/// Domain-separation prefix for internal node hashes.
pub const NODE_PREFIX: u8 = 0x01;

/// Hash of a committed leaf: binds the insertion-order index, the key and the
/// value together.
///
/// Layout: `LEAF_PREFIX ∥ index (u64 BE) ∥ key_len (u64 BE) ∥ key ∥ value`.
pub fn leaf_digest(index: u64, key: &[u8], value: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(index.to_be_bytes());
    hasher.update((key.len() as u64).to_be_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize().into()
}

/// Hash of an internal node from its two children.
pub fn node_digest(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkle root over a flat list of leaf hashes.
///
/// Splits at the largest power of two strictly below the length; a lone
/// subtree root is promoted unhashed. This is the reference the tree store's
/// incremental root must agree with, and what the property tests compare
/// against.
pub fn root_of(leaves: &[[u8; HASH_SIZE]]) -> [u8; HASH_SIZE] {
    match leaves.len() {
        0 => [0u8; HASH_SIZE],
        1 => leaves[0],
        n => {
            let split = largest_power_of_two_below(n);
            let left = root_of(&leaves[..split]);
            let right = root_of(&leaves[split..]);
            node_digest(&left, &right)
        }
    }
}

fn largest_power_of_two_below(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut p = 1usize;
    while p * 2 < n {
        p *= 2;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u64) -> Vec<[u8; HASH_SIZE]> {
        (0..n)
            .map(|i| leaf_digest(i, format!("k{}", i).as_bytes(), b"v"))
            .collect()
    }

    #[test]
    fn test_leaf_digest_binds_all_inputs() {
        let base = leaf_digest(0, b"key", b"value");
        assert_ne!(base, leaf_digest(1, b"key", b"value"));
        assert_ne!(base, leaf_digest(0, b"kex", b"value"));
        assert_ne!(base, leaf_digest(0, b"key", b"valuf"));
    }

    #[test]
    fn test_leaf_digest_length_framing() {
        // Moving a byte across the key/value boundary must change the hash.
        assert_ne!(leaf_digest(0, b"ab", b"c"), leaf_digest(0, b"a", b"bc"));
    }

    #[test]
    fn test_root_of_empty_is_zero() {
        assert_eq!(root_of(&[]), [0u8; HASH_SIZE]);
    }

    #[test]
    fn test_root_of_single_leaf_is_the_leaf() {
        let l = leaves(1);
        assert_eq!(root_of(&l), l[0]);
    }

    #[test]
    fn test_root_of_two_combines() {
        let l = leaves(2);
        assert_eq!(root_of(&l), node_digest(&l[0], &l[1]));
    }

    #[test]
    fn test_root_of_three_promotes_last() {
        let l = leaves(3);
        let left = node_digest(&l[0], &l[1]);
        assert_eq!(root_of(&l), node_digest(&left, &l[2]));
    }

    #[test]
    fn test_split_points() {
        assert_eq!(largest_power_of_two_below(2), 1);
        assert_eq!(largest_power_of_two_below(3), 2);
        assert_eq!(largest_power_of_two_below(4), 2);
        assert_eq!(largest_power_of_two_below(5), 4);
        assert_eq!(largest_power_of_two_below(9), 8);
    }
}
