//! In-memory store implementation.
//!
//! A `BTreeMap` behind an `RwLock`. Values are cloned on read so callers
//! never observe later writes through a returned buffer. Primarily for
//! tests and ephemeral tries, but also the template for durable adapters.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::{Hash256, NodeStore, Result};

/// An in-memory content-addressed byte map.
#[derive(Debug, Default)]
pub struct MemStore {
    data: RwLock<BTreeMap<Hash256, Vec<u8>>>,
}

impl MemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored nodes.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns whether `hash` has been written.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.data.read().contains_key(hash)
    }
}

impl NodeStore for MemStore {
    fn get(&self, hash: &Hash256) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(hash).cloned())
    }

    fn put(&self, hash: &Hash256, bytes: &[u8]) -> Result<()> {
        self.data.write().insert(*hash, bytes.to_vec());
        Ok(())
    }
}
