//! The trie engine.
//!
//! Mutations never touch the node graph directly: `set`/`delete` land in
//! a per-trie pool of pending writes keyed by nibble sequence, with
//! `None` as a deletion tombstone. `root_hash` and `flush` merge the
//! pool (and the pools of every snapshot reachable through `prev`) and
//! evaluate the result onto a root graph seeded from the committed hash.
//!
//! `snapshot` freezes the live pool by relinking it into a chain of
//! immutable handles and hands the live trie a fresh pool: O(1), no
//! node copies. Younger pools shadow older ones when the chain is
//! merged, so every handle observes the committed state plus its own
//! writes plus everything older.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use merkle_store::{Hash256, NodeStore};

use crate::nibbles::{common_prefix_len, Nibbles};
use crate::node::{BranchNode, Node, HASHABLE_SIZE};
use crate::{StoreError, EMPTY_ROOT};

use thiserror::Error;

/// Trie errors.
#[derive(Debug, Error)]
pub enum TrieError {
    /// A hash reference points at bytes the store does not have.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Stored bytes do not decode to a node shape.
    #[error("invalid node encoding")]
    InvalidNode,

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pending writes: nibble key to value, `None` marking a deletion.
type Pool = BTreeMap<Nibbles, Option<Vec<u8>>>;

/// Pool plus the snapshot back-pointer, swapped together under one lock.
struct PoolState<S: NodeStore> {
    entries: Pool,
    prev: Option<ImmutableTrie<S>>,
}

/// The lazily materialised root graph. `hashed` is true only while the
/// graph reflects every pool entry reachable from this handle.
struct RootState {
    node: Node,
    hashed: bool,
}

impl RootState {
    fn seeded(committed: Hash256) -> Self {
        Self {
            node: seed_root(committed),
            hashed: false,
        }
    }
}

/// A mutable Merkle Patricia trie over a content-addressed store.
pub struct Trie<S: NodeStore> {
    store: Arc<S>,
    committed: Hash256,
    pool: Mutex<PoolState<S>>,
    root: Mutex<RootState>,
}

/// A frozen point-in-time view of a trie: the committed root plus this
/// handle's pool plus every older pool in the chain. Cheap to clone.
pub struct ImmutableTrie<S: NodeStore> {
    inner: Arc<SnapshotInner<S>>,
}

struct SnapshotInner<S: NodeStore> {
    store: Arc<S>,
    committed: Hash256,
    entries: Pool,
    prev: Option<ImmutableTrie<S>>,
    root: Mutex<RootState>,
}

impl<S: NodeStore> Clone for ImmutableTrie<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: NodeStore> Trie<S> {
    /// Creates an empty trie.
    pub fn new(store: Arc<S>) -> Self {
        Self::open(store, EMPTY_ROOT)
    }

    /// Opens a trie at a previously committed root. Nothing is read
    /// until the root is first traversed.
    pub fn open(store: Arc<S>, root: Hash256) -> Self {
        Self {
            store,
            committed: root,
            pool: Mutex::new(PoolState {
                entries: Pool::new(),
                prev: None,
            }),
            root: Mutex::new(RootState::seeded(root)),
        }
    }

    /// Queues `key = value`. The buffer is copied; the caller may reuse
    /// it afterwards.
    ///
    /// An empty value is indistinguishable from an absent one in the
    /// canonical serialisation, so `set(key, b"")` deletes `key`.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        if value.is_empty() {
            return self.delete(key);
        }
        let nibbles = Nibbles::from_bytes(key);
        self.pool.lock().entries.insert(nibbles, Some(value.to_vec()));
        self.root.lock().hashed = false;
        Ok(())
    }

    /// Queues deletion of `key`. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<(), TrieError> {
        let nibbles = Nibbles::from_bytes(key);
        self.pool.lock().entries.insert(nibbles, None);
        self.root.lock().hashed = false;
        Ok(())
    }

    /// Looks `key` up: the pool first, then older snapshot pools, then
    /// the node graph. Returns `Ok(None)` for an absent key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        let nibbles = Nibbles::from_bytes(key);
        let prev = {
            let pool = self.pool.lock();
            if let Some(entry) = pool.entries.get(&nibbles) {
                return Ok(entry.clone());
            }
            pool.prev.clone()
        };
        if let Some(entry) = lookup_chain(prev.as_ref(), &nibbles) {
            return Ok(entry);
        }
        let mut root = self.root.lock();
        get_in_graph(&*self.store, &mut root.node, nibbles.as_slice())
    }

    /// Root hash over the committed state plus every pending write.
    pub fn root_hash(&self) -> Result<Hash256, TrieError> {
        {
            let mut root = self.root.lock();
            if root.hashed {
                return Ok(root.node.hash());
            }
        }
        let (pool, base) = {
            let pool = self.pool.lock();
            merge_chain(&pool.entries, self.committed, pool.prev.as_ref())
        };
        let mut root = self.root.lock();
        compute_root(&*self.store, &mut root, pool, base)
    }

    /// Freezes the current pool into an immutable handle and gives this
    /// trie a fresh one. O(1): pools are moved, never copied.
    pub fn snapshot(&self) -> ImmutableTrie<S> {
        let mut pool = self.pool.lock();
        let entries = std::mem::take(&mut pool.entries);
        let prev = pool.prev.take();
        trace!("snapshot frozen with {} pending writes", entries.len());
        let snapshot = ImmutableTrie {
            inner: Arc::new(SnapshotInner {
                store: self.store.clone(),
                committed: self.committed,
                entries,
                prev,
                root: Mutex::new(RootState::seeded(self.committed)),
            }),
        };
        pool.prev = Some(snapshot.clone());
        snapshot
    }

    /// Evaluates every pending write into the graph and writes all
    /// nodes at or above the inlining threshold through to the store,
    /// then promotes the result to the committed root and drops the
    /// pool and snapshot pointer.
    pub fn flush(&mut self) -> Result<(), TrieError> {
        let (pool, base) = {
            let pool = self.pool.get_mut();
            merge_chain(&pool.entries, self.committed, pool.prev.as_ref())
        };
        self.committed = base;

        if pool.is_empty() {
            let root = self.root.get_mut();
            root.node = seed_root(self.committed);
            root.hashed = false;
        } else {
            let root = self.root.get_mut();
            if !root.hashed {
                root.node = seed_root(base);
                evaluate(&*self.store, &mut root.node, pool)?;
                root.hashed = true;
            }
            let written = commit_graph(&*self.store, &mut root.node)?;
            // A root below the threshold is still written, or `open`
            // could never resolve the committed hash.
            let serialized = root.node.serialize();
            if serialized.len() < HASHABLE_SIZE
                && !matches!(root.node, Node::Empty | Node::Hash(_))
            {
                self.store.put(&root.node.hash(), &serialized)?;
            }
            self.committed = root.node.hash();
            debug!(
                "flushed {} nodes, committed root {}",
                written,
                hex::encode(self.committed)
            );
        }

        let pool = self.pool.get_mut();
        pool.entries.clear();
        pool.prev = None;
        Ok(())
    }

    /// Replaces this trie's state with a fresh copy of the supplied
    /// snapshot: same store, same committed hash, merged pools copied
    /// with younger-shadows-older semantics.
    pub fn reset(&mut self, from: &ImmutableTrie<S>) {
        let (pool, base) = from.merged_pool();
        trace!(
            "trie reset to committed root {} with {} pending writes",
            hex::encode(base),
            pool.len()
        );
        self.store = from.inner.store.clone();
        self.committed = base;
        *self.pool.get_mut() = PoolState {
            entries: pool,
            prev: None,
        };
        *self.root.get_mut() = RootState::seeded(base);
    }

    /// Merkle proof for `key`: the serialisation of every node on the
    /// path from the root to the terminal, root first. For an absent
    /// key the path ends at the point of divergence.
    pub fn prove(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, TrieError> {
        self.root_hash()?;
        let nibbles = Nibbles::from_bytes(key);
        let mut root = self.root.lock();
        let mut elements = Vec::new();
        prove_in_graph(&*self.store, &mut root.node, nibbles.as_slice(), &mut elements)?;
        Ok(elements)
    }
}

impl<S: NodeStore> ImmutableTrie<S> {
    /// Looks `key` up in the frozen state.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        let nibbles = Nibbles::from_bytes(key);
        if let Some(entry) = self.inner.entries.get(&nibbles) {
            return Ok(entry.clone());
        }
        if let Some(entry) = lookup_chain(self.inner.prev.as_ref(), &nibbles) {
            return Ok(entry);
        }
        let mut root = self.inner.root.lock();
        get_in_graph(&*self.inner.store, &mut root.node, nibbles.as_slice())
    }

    /// Root hash of the frozen state. Unaffected by later mutation of
    /// the live trie this snapshot was taken from.
    pub fn root_hash(&self) -> Result<Hash256, TrieError> {
        let mut root = self.inner.root.lock();
        if root.hashed {
            return Ok(root.node.hash());
        }
        let (pool, base) = self.merged_pool();
        compute_root(&*self.inner.store, &mut root, pool, base)
    }

    /// Merkle proof for `key` against the frozen state.
    pub fn prove(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, TrieError> {
        self.root_hash()?;
        let nibbles = Nibbles::from_bytes(key);
        let mut root = self.inner.root.lock();
        let mut elements = Vec::new();
        prove_in_graph(
            &*self.inner.store,
            &mut root.node,
            nibbles.as_slice(),
            &mut elements,
        )?;
        Ok(elements)
    }

    /// A snapshot is already frozen; snapshotting it is itself.
    pub fn snapshot(&self) -> ImmutableTrie<S> {
        self.clone()
    }

    fn merged_pool(&self) -> (Pool, Hash256) {
        merge_chain(
            &self.inner.entries,
            self.inner.committed,
            self.inner.prev.as_ref(),
        )
    }
}

fn seed_root(committed: Hash256) -> Node {
    if committed == EMPTY_ROOT {
        Node::Empty
    } else {
        Node::Hash(committed)
    }
}

/// Walks the snapshot chain young-to-old looking for `key`.
fn lookup_chain<S: NodeStore>(
    mut snapshot: Option<&ImmutableTrie<S>>,
    key: &Nibbles,
) -> Option<Option<Vec<u8>>> {
    while let Some(snap) = snapshot {
        if let Some(entry) = snap.inner.entries.get(key) {
            return Some(entry.clone());
        }
        snapshot = snap.inner.prev.as_ref();
    }
    None
}

/// Merges the pools along the chain (younger entries shadow older
/// ones) and returns the oldest reachable committed hash.
fn merge_chain<S: NodeStore>(
    entries: &Pool,
    committed: Hash256,
    prev: Option<&ImmutableTrie<S>>,
) -> (Pool, Hash256) {
    let mut merged = entries.clone();
    let mut base = committed;
    let mut snapshot = prev;
    while let Some(snap) = snapshot {
        for (key, entry) in &snap.inner.entries {
            merged
                .entry(key.clone())
                .or_insert_with(|| entry.clone());
        }
        base = snap.inner.committed;
        snapshot = snap.inner.prev.as_ref();
    }
    (merged, base)
}

/// Seeds the root from `base` and evaluates `pool` onto it.
fn compute_root<S: NodeStore>(
    store: &S,
    root: &mut RootState,
    pool: Pool,
    base: Hash256,
) -> Result<Hash256, TrieError> {
    root.node = seed_root(base);
    if pool.is_empty() {
        return Ok(root.node.hash());
    }
    evaluate(store, &mut root.node, pool)?;
    root.hashed = true;
    Ok(root.node.hash())
}

/// Applies every pool entry to the graph. Each key appears at most once
/// in a pool, so application order does not matter.
fn evaluate<S: NodeStore>(store: &S, root: &mut Node, pool: Pool) -> Result<(), TrieError> {
    for (key, entry) in pool {
        let current = std::mem::take(root);
        let (next, _) = match entry {
            Some(value) => set_at(store, current, key.as_slice(), &value)?,
            None => delete_at(store, current, key.as_slice())?,
        };
        *root = next;
    }
    Ok(())
}

/// Loads and decodes the node stored under `hash`, priming its memo
/// cache so re-serialising it is free.
fn resolve<S: NodeStore>(store: &S, hash: &Hash256) -> Result<Node, TrieError> {
    let bytes = store
        .get(hash)?
        .ok_or_else(|| TrieError::NodeNotFound(hex::encode(hash)))?;
    let mut node = Node::decode(&bytes).ok_or(TrieError::InvalidNode)?;
    node.prime_cache(bytes, *hash);
    Ok(node)
}

/// Looks `key` up in the graph, materialising hash references in place
/// as they are crossed.
fn get_in_graph<S: NodeStore>(
    store: &S,
    node: &mut Node,
    key: &[u8],
) -> Result<Option<Vec<u8>>, TrieError> {
    match node {
        Node::Empty => Ok(None),
        Node::Hash(hash) => {
            let hash = *hash;
            *node = resolve(store, &hash)?;
            get_in_graph(store, node, key)
        }
        Node::Leaf(leaf) => Ok((leaf.key_end.as_slice() == key).then(|| leaf.value.clone())),
        Node::Extension(ext) => {
            if key.starts_with(ext.shared.as_slice()) {
                let shared_len = ext.shared.len();
                get_in_graph(store, &mut ext.next, &key[shared_len..])
            } else {
                Ok(None)
            }
        }
        Node::Branch(branch) => match key.split_first() {
            None => Ok(branch.value.clone()),
            Some((&nibble, rest)) => {
                get_in_graph(store, &mut branch.children[nibble as usize], rest)
            }
        },
    }
}

/// Inserts `key = value` under `node`, returning the replacement
/// subtree root and whether anything changed.
fn set_at<S: NodeStore>(
    store: &S,
    node: Node,
    key: &[u8],
    value: &[u8],
) -> Result<(Node, bool), TrieError> {
    match node {
        Node::Empty => Ok((Node::leaf(Nibbles::from_nibbles(key), value.to_vec()), true)),

        Node::Hash(hash) => {
            let resolved = resolve(store, &hash)?;
            set_at(store, resolved, key, value)
        }

        Node::Leaf(mut leaf) => {
            let matched = common_prefix_len(leaf.key_end.as_slice(), key);
            if matched == leaf.key_end.len() && matched == key.len() {
                if leaf.value == value {
                    return Ok((Node::Leaf(leaf), false));
                }
                leaf.value = value.to_vec();
                leaf.mark_dirty();
                return Ok((Node::Leaf(leaf), true));
            }

            // Split: both tails hang off a new branch at the fork.
            let mut branch = BranchNode::new();
            if matched == leaf.key_end.len() {
                branch.value = Some(leaf.value);
            } else {
                let idx = leaf.key_end.as_slice()[matched] as usize;
                branch.children[idx] =
                    Node::leaf(leaf.key_end.suffix(matched + 1), leaf.value);
            }
            if matched == key.len() {
                branch.value = Some(value.to_vec());
            } else {
                let idx = key[matched] as usize;
                branch.children[idx] =
                    Node::leaf(Nibbles::from_nibbles(&key[matched + 1..]), value.to_vec());
            }
            Ok((wrap_prefix(&key[..matched], Node::branch(branch)), true))
        }

        Node::Extension(mut ext) => {
            let matched = common_prefix_len(ext.shared.as_slice(), key);
            if matched == ext.shared.len() {
                let child = std::mem::take(&mut ext.next);
                let (next, changed) = set_at(store, child, &key[matched..], value)?;
                ext.next = next;
                if changed {
                    ext.mark_dirty();
                }
                return Ok((Node::Extension(ext), changed));
            }

            // Split the shared path at the fork. A one-nibble remainder
            // degenerates to the extension's child directly.
            let mut branch = BranchNode::new();
            let idx = ext.shared.as_slice()[matched] as usize;
            let child = std::mem::take(&mut ext.next);
            branch.children[idx] = if matched + 1 == ext.shared.len() {
                child
            } else {
                Node::extension(ext.shared.suffix(matched + 1), child)
            };
            if matched == key.len() {
                branch.value = Some(value.to_vec());
            } else {
                let key_idx = key[matched] as usize;
                branch.children[key_idx] =
                    Node::leaf(Nibbles::from_nibbles(&key[matched + 1..]), value.to_vec());
            }
            Ok((wrap_prefix(&key[..matched], Node::branch(branch)), true))
        }

        Node::Branch(mut branch) => {
            if key.is_empty() {
                if branch.value.as_deref() == Some(value) {
                    return Ok((Node::Branch(branch), false));
                }
                branch.value = Some(value.to_vec());
                branch.mark_dirty();
                return Ok((Node::Branch(branch), true));
            }
            let idx = key[0] as usize;
            let child = std::mem::take(&mut branch.children[idx]);
            let (next, changed) = set_at(store, child, &key[1..], value)?;
            branch.children[idx] = next;
            if changed {
                branch.mark_dirty();
            }
            Ok((Node::Branch(branch), changed))
        }
    }
}

/// Removes `key` under `node`. A miss returns the subtree unchanged
/// with `changed = false`.
fn delete_at<S: NodeStore>(
    store: &S,
    node: Node,
    key: &[u8],
) -> Result<(Node, bool), TrieError> {
    match node {
        Node::Empty => Ok((Node::Empty, false)),

        Node::Hash(hash) => {
            let resolved = resolve(store, &hash)?;
            delete_at(store, resolved, key)
        }

        Node::Leaf(leaf) => {
            if leaf.key_end.as_slice() == key {
                Ok((Node::Empty, true))
            } else {
                Ok((Node::Leaf(leaf), false))
            }
        }

        Node::Extension(mut ext) => {
            if !key.starts_with(ext.shared.as_slice()) {
                return Ok((Node::Extension(ext), false));
            }
            let shared_len = ext.shared.len();
            let child = std::mem::take(&mut ext.next);
            let (next, changed) = delete_at(store, child, &key[shared_len..])?;
            if !changed {
                ext.next = next;
                return Ok((Node::Extension(ext), false));
            }
            // Extensions never chain to extensions, and a leaf child
            // fuses its path into this one.
            let fused = match next {
                Node::Leaf(child) => {
                    Node::leaf(ext.shared.concat(&child.key_end), child.value)
                }
                Node::Extension(child) => {
                    Node::extension(ext.shared.concat(&child.shared), child.next)
                }
                other => {
                    ext.next = other;
                    ext.mark_dirty();
                    Node::Extension(ext)
                }
            };
            Ok((fused, true))
        }

        Node::Branch(mut branch) => {
            if key.is_empty() {
                if branch.value.is_none() {
                    return Ok((Node::Branch(branch), false));
                }
                branch.value = None;
            } else {
                let idx = key[0] as usize;
                let child = std::mem::take(&mut branch.children[idx]);
                let (next, changed) = delete_at(store, child, &key[1..])?;
                branch.children[idx] = next;
                if !changed {
                    return Ok((Node::Branch(branch), false));
                }
            }
            branch.mark_dirty();
            Ok((collapse_branch(store, branch)?, true))
        }
    }
}

/// Applies the single-occupant collapse rules after a deletion. A
/// branch keeps at least two occupants; below that it becomes a leaf,
/// an extension, or disappears.
fn collapse_branch<S: NodeStore>(
    store: &S,
    mut branch: Box<BranchNode>,
) -> Result<Node, TrieError> {
    if branch.occupant_count() >= 2 {
        return Ok(Node::Branch(branch));
    }
    let Some(idx) = branch.sole_child_index() else {
        return Ok(match branch.value.take() {
            Some(value) => Node::leaf(Nibbles::new(), value),
            None => Node::Empty,
        });
    };
    let child = std::mem::take(&mut branch.children[idx]);
    // The sole occupant may still be an unresolved reference; the
    // collapse rules dispatch on its actual shape.
    let child = match child {
        Node::Hash(hash) => resolve(store, &hash)?,
        resolved => resolved,
    };
    Ok(match child {
        Node::Leaf(leaf) => Node::leaf(leaf.key_end.prepended(idx as u8), leaf.value),
        Node::Extension(ext) => Node::extension(ext.shared.prepended(idx as u8), ext.next),
        child @ Node::Branch(_) => {
            Node::extension(Nibbles::from_nibbles(&[idx as u8]), child)
        }
        // `resolve` only produces materialised shapes.
        other => other,
    })
}

/// Post-order write-through of every node at or above the inlining
/// threshold. Smaller nodes live inside their parent's serialisation.
fn commit_graph<S: NodeStore>(store: &S, node: &mut Node) -> Result<usize, TrieError> {
    let mut written = 0;
    match node {
        Node::Branch(branch) => {
            for child in &mut branch.children {
                written += commit_graph(store, child)?;
            }
        }
        Node::Extension(ext) => {
            written += commit_graph(store, &mut ext.next)?;
        }
        Node::Leaf(_) => {}
        Node::Empty | Node::Hash(_) => return Ok(0),
    }
    let serialized = node.serialize();
    if serialized.len() >= HASHABLE_SIZE {
        store.put(&node.hash(), &serialized)?;
        written += 1;
    }
    Ok(written)
}

/// Collects the serialisation of every node on the path to `key`,
/// root first, resolving hash references as they are crossed.
fn prove_in_graph<S: NodeStore>(
    store: &S,
    node: &mut Node,
    key: &[u8],
    out: &mut Vec<Vec<u8>>,
) -> Result<(), TrieError> {
    match node {
        Node::Empty => Ok(()),
        Node::Hash(hash) => {
            let hash = *hash;
            *node = resolve(store, &hash)?;
            prove_in_graph(store, node, key, out)
        }
        Node::Leaf(leaf) => {
            out.push(leaf.serialize());
            Ok(())
        }
        Node::Extension(ext) => {
            out.push(ext.serialize());
            if key.starts_with(ext.shared.as_slice()) {
                let shared_len = ext.shared.len();
                prove_in_graph(store, &mut ext.next, &key[shared_len..], out)
            } else {
                Ok(())
            }
        }
        Node::Branch(branch) => {
            out.push(branch.serialize());
            match key.split_first() {
                None => Ok(()),
                Some((&nibble, rest)) => {
                    prove_in_graph(store, &mut branch.children[nibble as usize], rest, out)
                }
            }
        }
    }
}

fn wrap_prefix(prefix: &[u8], node: Node) -> Node {
    if prefix.is_empty() {
        node
    } else {
        Node::extension(Nibbles::from_nibbles(prefix), node)
    }
}
