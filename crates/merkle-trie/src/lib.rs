//! Persistent, hash-addressed Merkle Patricia trie.
//!
//! Maps byte-string keys to byte-string values with:
//! - Cryptographically verifiable root hashes (keccak-256 over a
//!   canonical node serialisation)
//! - Deferred writes: `set`/`delete` land in a per-trie pool and are
//!   only materialised into the node graph on demand
//! - O(1) copy-on-write snapshots chained through frozen pools
//! - Merkle proofs verifiable by independent implementations
//! - Flush-through persistence to a content-addressed byte store

pub mod codec;
mod nibbles;
mod node;
mod proof;
mod trie;

pub use nibbles::Nibbles;
pub use node::{BranchNode, ExtensionNode, LeafNode, Node, HASHABLE_SIZE};
pub use proof::{verify_proof, ProofError};
pub use trie::{ImmutableTrie, Trie, TrieError};

pub use merkle_store::{Hash256, MemStore, NodeStore, StoreError};

use sha3::{Digest, Keccak256};

/// Hashes `data` with keccak-256.
pub fn keccak256(data: &[u8]) -> Hash256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Root hash of the empty trie: keccak-256 of the empty byte-string
/// encoding (`0x80`).
pub const EMPTY_ROOT: Hash256 = [
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, //
    0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e, //
    0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, //
    0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21, //
];
