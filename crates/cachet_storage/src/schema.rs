//! Persisted key and value encodings.
//!
//! Three byte layouts are fixed forever:
//! - tree node keys: `[TS_PREFIX, layer (u8), index (u64 BE)]`
//! - layer-0 node values: `hash (32) ∥ user key` (the leaf reference)
//! - sorted-set member keys: `set ∥ 0x00 ∥ score (8, order-preserving) ∥ 0x00 ∥ key`

use cachet_common::error::{StoreError, StoreResult};
use cachet_common::types::{HASH_SIZE, TS_PREFIX};

/// Byte length of a tree node key.
pub const TREE_KEY_LEN: usize = 1 + 1 + 8;

/// Separator between the components of a sorted-set member key.
const SET_SEPARATOR: u8 = 0x00;

/// Persistence address of tree node `(layer, index)`.
pub fn tree_key(layer: u8, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(TREE_KEY_LEN);
    key.push(TS_PREFIX);
    key.push(layer);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Prefix addressing every node of one layer.
pub fn tree_layer_prefix(layer: u8) -> [u8; 2] {
    [TS_PREFIX, layer]
}

/// On-disk value of a layer-0 node: the leaf hash followed by the user key,
/// so an index can be resolved back to its key without visiting the value row.
pub fn ref_tree_key(hash: &[u8; HASH_SIZE], key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HASH_SIZE + key.len());
    buf.extend_from_slice(hash);
    buf.extend_from_slice(key);
    buf
}

/// Split a stored leaf reference back into (hash, user key).
pub fn decode_ref_tree_key(raw: &[u8]) -> StoreResult<([u8; HASH_SIZE], Vec<u8>)> {
    if raw.len() <= HASH_SIZE {
        // A bare hash with no trailing key is the obsolete layout.
        return Err(StoreError::ObsoleteDataFormat);
    }
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&raw[..HASH_SIZE]);
    Ok((hash, raw[HASH_SIZE..].to_vec()))
}

/// Encode an IEEE-754 double so that unsigned byte order equals numeric order
/// across the full range, negatives included: flip the sign bit for
/// non-negatives, invert every bit for negatives. Big-endian.
pub fn score_bytes(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let encoded = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits ^ (1u64 << 63)
    };
    encoded.to_be_bytes()
}

/// Composite key for a sorted-set member. Lexicographic order over the result
/// equals (set ascending, score ascending, key ascending).
pub fn set_key(set: &[u8], score: f64, key: &[u8]) -> Vec<u8> {
    let score = score_bytes(score);
    let mut buf = Vec::with_capacity(set.len() + 1 + score.len() + 1 + key.len());
    buf.extend_from_slice(set);
    buf.push(SET_SEPARATOR);
    buf.extend_from_slice(&score);
    buf.push(SET_SEPARATOR);
    buf.extend_from_slice(key);
    buf
}

/// Prefix addressing every member of one sorted set.
pub fn set_prefix(set: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(set.len() + 1);
    buf.extend_from_slice(set);
    buf.push(SET_SEPARATOR);
    buf
}

/// Reject empty keys and keys that would collide with the tree's reserved
/// prefix.
pub fn check_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() || key[0] == TS_PREFIX {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

/// Reject empty or reserved-prefix set names.
pub fn check_set(set: &[u8]) -> StoreResult<()> {
    if set.is_empty() || set[0] == TS_PREFIX {
        return Err(StoreError::InvalidSet);
    }
    Ok(())
}

/// Reject empty or reserved-prefix aliases for `reference`.
pub fn check_reference(alias: &[u8]) -> StoreResult<()> {
    if alias.is_empty() || alias[0] == TS_PREFIX {
        return Err(StoreError::InvalidReference);
    }
    Ok(())
}
