//! Trie node algebra.
//!
//! Four materialised node shapes plus an unresolved hash reference:
//! - `Leaf`: terminal path fragment carrying a value
//! - `Extension`: non-empty shared path fragment; its child is always a
//!   branch (or a hash reference to one)
//! - `Branch`: 16-way fan-out on the next nibble plus an optional value
//!   for the key ending exactly here
//! - `Hash`: pointer into the backing store, materialised on demand
//!
//! Serialisation and hashing are memoised per node. The cache being
//! unset is the dirty state; structural mutation clears it, and the
//! engine clears every ancestor along a changed path.

use crate::codec;
use crate::nibbles::Nibbles;
use crate::{keccak256, Hash256, EMPTY_ROOT};

/// Children whose serialisation reaches this many bytes are referenced
/// from their parent by hash; shorter ones are inlined verbatim.
pub const HASHABLE_SIZE: usize = 32;

/// Memoised serialisation and hash. Unset means dirty.
#[derive(Debug, Clone, Default)]
struct NodeCache {
    serialized: Option<Vec<u8>>,
    hashed: Option<Hash256>,
}

impl NodeCache {
    fn clear(&mut self) {
        self.serialized = None;
        self.hashed = None;
    }
}

/// A terminal node: the rest of the key and its value.
#[derive(Debug, Clone)]
pub struct LeafNode {
    pub key_end: Nibbles,
    pub value: Vec<u8>,
    cache: NodeCache,
}

impl LeafNode {
    pub fn new(key_end: Nibbles, value: Vec<u8>) -> Self {
        Self {
            key_end,
            value,
            cache: NodeCache::default(),
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.cache.clear();
    }

    pub fn serialize(&mut self) -> Vec<u8> {
        if let Some(cached) = &self.cache.serialized {
            return cached.clone();
        }
        let encoded = codec::encode_list(&[
            codec::encode_bytes(&self.key_end.to_hex_prefix(true)),
            codec::encode_bytes(&self.value),
        ]);
        self.cache.serialized = Some(encoded.clone());
        encoded
    }

    pub fn hash(&mut self) -> Hash256 {
        if let Some(hashed) = self.cache.hashed {
            return hashed;
        }
        let hashed = keccak256(&self.serialize());
        self.cache.hashed = Some(hashed);
        hashed
    }
}

/// A compressed single-child path segment. `shared` is never empty and
/// `next` is never another extension.
#[derive(Debug, Clone)]
pub struct ExtensionNode {
    pub shared: Nibbles,
    pub next: Node,
    cache: NodeCache,
}

impl ExtensionNode {
    pub fn new(shared: Nibbles, next: Node) -> Self {
        Self {
            shared,
            next,
            cache: NodeCache::default(),
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.cache.clear();
    }

    pub fn serialize(&mut self) -> Vec<u8> {
        if let Some(cached) = &self.cache.serialized {
            return cached.clone();
        }
        let encoded = codec::encode_list(&[
            codec::encode_bytes(&self.shared.to_hex_prefix(false)),
            self.next.child_encoding(),
        ]);
        self.cache.serialized = Some(encoded.clone());
        encoded
    }

    pub fn hash(&mut self) -> Hash256 {
        if let Some(hashed) = self.cache.hashed {
            return hashed;
        }
        let hashed = keccak256(&self.serialize());
        self.cache.hashed = Some(hashed);
        hashed
    }
}

/// 16-way fan-out plus the value whose key ends at this node.
#[derive(Debug, Clone)]
pub struct BranchNode {
    pub children: [Node; 16],
    pub value: Option<Vec<u8>>,
    cache: NodeCache,
}

impl Default for BranchNode {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchNode {
    pub fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| Node::Empty),
            value: None,
            cache: NodeCache::default(),
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.cache.clear();
    }

    /// Non-empty children plus one if the value slot is occupied.
    pub fn occupant_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
            + usize::from(self.value.is_some())
    }

    /// Index of the only non-empty child, if there is exactly one.
    pub fn sole_child_index(&self) -> Option<usize> {
        let mut found = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some(i);
            }
        }
        found
    }

    pub fn serialize(&mut self) -> Vec<u8> {
        if let Some(cached) = &self.cache.serialized {
            return cached.clone();
        }
        let mut items = Vec::with_capacity(17);
        for child in &mut self.children {
            items.push(child.child_encoding());
        }
        items.push(codec::encode_bytes(self.value.as_deref().unwrap_or(&[])));
        let encoded = codec::encode_list(&items);
        self.cache.serialized = Some(encoded.clone());
        encoded
    }

    pub fn hash(&mut self) -> Hash256 {
        if let Some(hashed) = self.cache.hashed {
            return hashed;
        }
        let hashed = keccak256(&self.serialize());
        self.cache.hashed = Some(hashed);
        hashed
    }
}

/// A trie node.
#[derive(Debug, Clone, Default)]
pub enum Node {
    /// No node. Serialises as the empty byte string.
    #[default]
    Empty,
    Leaf(Box<LeafNode>),
    Extension(Box<ExtensionNode>),
    Branch(Box<BranchNode>),
    /// Unresolved reference to a stored node.
    Hash(Hash256),
}

impl Node {
    pub fn leaf(key_end: Nibbles, value: Vec<u8>) -> Self {
        Node::Leaf(Box::new(LeafNode::new(key_end, value)))
    }

    pub fn extension(shared: Nibbles, next: Node) -> Self {
        Node::Extension(Box::new(ExtensionNode::new(shared, next)))
    }

    pub fn branch(branch: BranchNode) -> Self {
        Node::Branch(Box::new(branch))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    /// Canonical serialisation. For a hash reference this is its
    /// reference encoding; the stored bytes live behind the store.
    pub fn serialize(&mut self) -> Vec<u8> {
        match self {
            Node::Empty => codec::encode_bytes(&[]),
            Node::Leaf(leaf) => leaf.serialize(),
            Node::Extension(ext) => ext.serialize(),
            Node::Branch(branch) => branch.serialize(),
            Node::Hash(hash) => codec::encode_bytes(&hash[..]),
        }
    }

    /// keccak-256 of the serialisation; the referenced hash itself for
    /// a hash reference.
    pub fn hash(&mut self) -> Hash256 {
        match self {
            Node::Empty => EMPTY_ROOT,
            Node::Leaf(leaf) => leaf.hash(),
            Node::Extension(ext) => ext.hash(),
            Node::Branch(branch) => branch.hash(),
            Node::Hash(hash) => *hash,
        }
    }

    /// How this node appears inside its parent's serialisation: absent
    /// children as the empty string, large children by hash, small ones
    /// inlined verbatim.
    pub fn child_encoding(&mut self) -> Vec<u8> {
        match self {
            Node::Empty => codec::encode_bytes(&[]),
            Node::Hash(hash) => codec::encode_bytes(&hash[..]),
            _ => {
                let serialized = self.serialize();
                if serialized.len() >= HASHABLE_SIZE {
                    codec::encode_bytes(&self.hash())
                } else {
                    serialized
                }
            }
        }
    }

    /// Decodes a canonical serialisation.
    ///
    /// Only materialised shapes come back: a 17-item list is a branch, a
    /// 2-item list is a leaf or extension depending on the hex-prefix
    /// flag. Child slots decode to `Hash`, `Empty`, or, for inlined
    /// children, the node itself.
    pub fn decode(bytes: &[u8]) -> Option<Node> {
        let items = codec::decode_list(bytes)?;
        match items.len() {
            17 => {
                let mut branch = BranchNode::new();
                for (i, item) in items[..16].iter().enumerate() {
                    branch.children[i] = decode_child(item)?;
                }
                let value = codec::decode_bytes(&items[16])?;
                branch.value = (!value.is_empty()).then_some(value);
                Some(Node::branch(branch))
            }
            2 => {
                let path = codec::decode_bytes(&items[0])?;
                let (nibbles, is_leaf) = Nibbles::from_hex_prefix(&path)?;
                if is_leaf {
                    Some(Node::leaf(nibbles, codec::decode_bytes(&items[1])?))
                } else {
                    Some(Node::extension(nibbles, decode_child(&items[1])?))
                }
            }
            _ => None,
        }
    }

    /// Seeds the memo cache of a node just loaded from the store, so
    /// re-serialising an untouched node is free and hash-stable.
    pub(crate) fn prime_cache(&mut self, serialized: Vec<u8>, hashed: Hash256) {
        let cache = NodeCache {
            serialized: Some(serialized),
            hashed: Some(hashed),
        };
        match self {
            Node::Leaf(leaf) => leaf.cache = cache,
            Node::Extension(ext) => ext.cache = cache,
            Node::Branch(branch) => branch.cache = cache,
            Node::Empty | Node::Hash(_) => {}
        }
    }
}

fn decode_child(item: &[u8]) -> Option<Node> {
    match item.first() {
        None => Some(Node::Empty),
        // Nested list: a child small enough to be inlined.
        Some(&prefix) if prefix >= 0xc0 => Node::decode(item),
        _ => {
            let bytes = codec::decode_bytes(item)?;
            if bytes.is_empty() {
                Some(Node::Empty)
            } else {
                Some(Node::Hash(bytes.try_into().ok()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_round_trip() {
        let mut leaf = LeafNode::new(Nibbles::from_bytes(b"do"), b"verb".to_vec());
        let encoded = leaf.serialize();

        match Node::decode(&encoded) {
            Some(Node::Leaf(decoded)) => {
                assert_eq!(decoded.key_end, leaf.key_end);
                assert_eq!(decoded.value, leaf.value);
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_extension_round_trip() {
        let mut ext = ExtensionNode::new(
            Nibbles::from_nibbles(&[1, 2, 3]),
            Node::Hash([0xee; 32]),
        );
        let encoded = ext.serialize();

        match Node::decode(&encoded) {
            Some(Node::Extension(decoded)) => {
                assert_eq!(decoded.shared, ext.shared);
                assert!(matches!(decoded.next, Node::Hash(h) if h == [0xee; 32]));
            }
            other => panic!("expected extension, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_round_trip() {
        let mut branch = BranchNode::new();
        branch.children[3] = Node::Hash([0x11; 32]);
        branch.children[9] = Node::leaf(Nibbles::from_nibbles(&[5]), b"v".to_vec());
        branch.value = Some(b"here".to_vec());
        let encoded = Node::branch(branch).serialize();

        match Node::decode(&encoded) {
            Some(Node::Branch(decoded)) => {
                assert!(matches!(decoded.children[3], Node::Hash(h) if h == [0x11; 32]));
                assert!(matches!(decoded.children[9], Node::Leaf(_)));
                assert!(decoded.children[0].is_empty());
                assert_eq!(decoded.value, Some(b"here".to_vec()));
            }
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn test_hash_is_keccak_of_serialisation() {
        let mut node = Node::leaf(Nibbles::from_bytes(b"key"), b"value".to_vec());
        assert_eq!(node.hash(), keccak256(&node.serialize()));
    }

    #[test]
    fn test_empty_node_hash() {
        assert_eq!(Node::Empty.hash(), EMPTY_ROOT);
        assert_eq!(Node::Empty.serialize(), vec![0x80]);
    }

    #[test]
    fn test_memoisation_invalidated_by_mutation() {
        let mut leaf = LeafNode::new(Nibbles::from_bytes(b"k"), b"v1".to_vec());
        let before = leaf.hash();

        leaf.value = b"v2".to_vec();
        leaf.mark_dirty();
        let after = leaf.hash();

        assert_ne!(before, after);
        assert_eq!(after, keccak256(&leaf.serialize()));
    }

    #[test]
    fn test_memoisation_is_stable_without_mutation() {
        let mut branch = BranchNode::new();
        branch.value = Some(b"payload".to_vec());
        let first = branch.serialize();
        let second = branch.serialize();
        assert_eq!(first, second);
        assert_eq!(branch.hash(), branch.hash());
    }

    #[test]
    fn test_small_child_is_inlined_large_child_by_hash() {
        let mut small = Node::leaf(Nibbles::from_nibbles(&[1]), b"v".to_vec());
        let inline = small.child_encoding();
        assert_eq!(inline, small.serialize());

        let mut large = Node::leaf(Nibbles::from_bytes(&[0x77; 16]), vec![0xcc; 40]);
        let by_hash = large.child_encoding();
        assert_eq!(by_hash, codec::encode_bytes(&large.hash()));
    }

    #[test]
    fn test_branch_occupants() {
        let mut branch = BranchNode::new();
        assert_eq!(branch.occupant_count(), 0);
        assert_eq!(branch.sole_child_index(), None);

        branch.children[4] = Node::leaf(Nibbles::new(), b"a".to_vec());
        assert_eq!(branch.occupant_count(), 1);
        assert_eq!(branch.sole_child_index(), Some(4));

        branch.value = Some(b"b".to_vec());
        assert_eq!(branch.occupant_count(), 2);

        branch.children[12] = Node::Hash([0; 32]);
        assert_eq!(branch.sole_child_index(), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Node::decode(&[]).is_none());
        assert!(Node::decode(&[0x80]).is_none());
        // Three-item lists are not a node shape.
        let bad = codec::encode_list(&[
            codec::encode_bytes(b"a"),
            codec::encode_bytes(b"b"),
            codec::encode_bytes(b"c"),
        ]);
        assert!(Node::decode(&bad).is_none());
    }
}
