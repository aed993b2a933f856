//! Append-only, Merkle-authenticated key-value storage engine.
//!
//! Every write is appended at a monotonically increasing commit timestamp; no
//! version is ever overwritten. Committed entries are continuously summarized
//! by an append-only Merkle tree whose root can be exported as a cryptographic
//! commitment to the entire history.
//!
//! Write path: validate → stage in backing txn → reserve tree leaf → commit
//!             at the reserved timestamp → publish (or discard) the leaf
//! Read path:  backing snapshot at the latest timestamp, with transparent
//!             reference resolution; per-index reads go through the tree.

pub mod backing;
pub mod digest;
pub mod schema;
pub mod store;
pub mod tree;


pub use cachet_common::config::Options;
pub use cachet_common::error::{StoreError, StoreResult};
pub use cachet_common::types::{Entry, KvList, KvPair, RawKv, Root, Tree};
pub use store::{Store, WriteOptions};
