//! Content-addressed node storage.
//!
//! This crate provides the backing-store contract for the merkle trie:
//! a byte map keyed by the keccak-256 hash of the stored bytes. There is
//! no delete (nodes that become unreachable are simply never read again)
//! and no iteration; the trie engine only ever resolves known hashes.
//!
//! # Example
//!
//! ```
//! use merkle_store::{MemStore, NodeStore};
//!
//! let store = MemStore::new();
//! store.put(&[0xab; 32], b"node bytes").unwrap();
//! assert_eq!(store.get(&[0xab; 32]).unwrap(), Some(b"node bytes".to_vec()));
//! ```

mod error;
mod memstore;

pub use error::{Result, StoreError};
pub use memstore::MemStore;

/// A 32-byte content hash used as a storage key.
pub type Hash256 = [u8; 32];

/// A content-addressed byte map.
///
/// Implementations must be safe for concurrent `get` and `put`; the trie
/// engine serialises its own flushes but shares one store handle across
/// every trie derived from the same root.
pub trait NodeStore: Send + Sync {
    /// Returns the bytes stored under `hash`.
    /// Returns `Ok(None)` if the hash has never been written.
    fn get(&self, hash: &Hash256) -> Result<Option<Vec<u8>>>;

    /// Stores `bytes` under `hash`.
    ///
    /// Keys are content hashes, so rewriting an existing key always
    /// rewrites identical bytes.
    fn put(&self, hash: &Hash256, bytes: &[u8]) -> Result<()>;
}
