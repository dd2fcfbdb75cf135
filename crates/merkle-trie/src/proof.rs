//! Merkle proof verification.
//!
//! A proof is the root-first list of node serialisations along the path
//! to a key (see [`Trie::prove`](crate::Trie::prove)). Verification
//! re-walks that path: the first element must hash to the claimed root,
//! every later element must match the child reference in its parent (by
//! hash for stored children, by byte equality for inlined ones), and
//! the terminal must agree with the claimed value. Absence is only
//! accepted when the proof witnesses the divergence; a truncated proof
//! never verifies.

use thiserror::Error;

use merkle_store::Hash256;

use crate::keccak256;
use crate::nibbles::Nibbles;
use crate::node::Node;
use crate::EMPTY_ROOT;

/// Proof verification errors.
#[derive(Debug, Error)]
pub enum ProofError {
    /// An element does not match the reference its parent committed to.
    #[error("proof element {0} does not match its expected reference")]
    HashMismatch(usize),

    /// The walk ended without reaching a terminal.
    #[error("proof ends before the key path is resolved")]
    Incomplete,

    /// The derived value disagrees with the claimed one.
    #[error("proof value disagrees with the claimed value")]
    ValueMismatch,

    /// The proof is structurally broken.
    #[error("malformed proof: {0}")]
    Malformed(String),
}

/// What the parent's serialisation commits the next element to be.
enum ChildRef {
    Hash(Hash256),
    Inline(Vec<u8>),
    Empty,
}

fn child_ref(node: Node) -> ChildRef {
    match node {
        Node::Empty => ChildRef::Empty,
        Node::Hash(hash) => ChildRef::Hash(hash),
        mut inline => ChildRef::Inline(inline.child_encoding()),
    }
}

/// Verifies `proof` for `key` against `root`.
///
/// `expected` is the claimed result: `Some(value)` proves presence,
/// `None` proves absence. Returns `Ok(())` only when the proof chain is
/// intact and derives exactly the claimed result.
pub fn verify_proof(
    root: &Hash256,
    key: &[u8],
    expected: Option<&[u8]>,
    proof: &[Vec<u8>],
) -> Result<(), ProofError> {
    let nibbles = Nibbles::from_bytes(key);
    let path = nibbles.as_slice();

    if *root == EMPTY_ROOT {
        if !proof.is_empty() {
            return Err(ProofError::Malformed(
                "the empty root proves nothing but absence".into(),
            ));
        }
        return match expected {
            None => Ok(()),
            Some(_) => Err(ProofError::ValueMismatch),
        };
    }
    if proof.is_empty() {
        return Err(ProofError::Incomplete);
    }

    let mut next_ref = ChildRef::Hash(*root);
    let mut offset = 0;
    // Set once the walk reaches a terminal: the value derived for `key`.
    let mut outcome: Option<Option<Vec<u8>>> = None;

    for (index, element) in proof.iter().enumerate() {
        if outcome.is_some() {
            return Err(ProofError::Malformed(format!(
                "element {index} follows the terminal"
            )));
        }
        match &next_ref {
            ChildRef::Hash(hash) => {
                if keccak256(element) != *hash {
                    return Err(ProofError::HashMismatch(index));
                }
            }
            ChildRef::Inline(bytes) => {
                if element != bytes {
                    return Err(ProofError::HashMismatch(index));
                }
            }
            ChildRef::Empty => {
                return Err(ProofError::Malformed(format!(
                    "element {index} follows a divergence"
                )));
            }
        }

        let node = Node::decode(element)
            .ok_or_else(|| ProofError::Malformed(format!("element {index} does not decode")))?;
        match node {
            Node::Leaf(leaf) => {
                let matches = leaf.key_end.as_slice() == &path[offset..];
                outcome = Some(matches.then(|| leaf.value));
            }
            Node::Extension(ext) => {
                if path[offset..].starts_with(ext.shared.as_slice()) {
                    offset += ext.shared.len();
                    next_ref = child_ref(ext.next);
                } else {
                    outcome = Some(None);
                }
            }
            Node::Branch(branch) => {
                if offset == path.len() {
                    outcome = Some(branch.value);
                } else {
                    let nibble = path[offset] as usize;
                    offset += 1;
                    let mut children = branch.children;
                    match std::mem::take(&mut children[nibble]) {
                        Node::Empty => outcome = Some(None),
                        child => next_ref = child_ref(child),
                    }
                }
            }
            Node::Empty | Node::Hash(_) => {
                return Err(ProofError::Malformed(format!(
                    "element {index} is not a materialised node"
                )));
            }
        }
    }

    match outcome {
        None => Err(ProofError::Incomplete),
        Some(derived) if derived.as_deref() == expected => Ok(()),
        Some(_) => Err(ProofError::ValueMismatch),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{MemStore, Trie};

    fn populated_trie() -> Trie<MemStore> {
        let trie = Trie::new(Arc::new(MemStore::new()));
        trie.set(b"do", b"verb").unwrap();
        trie.set(b"dog", b"puppy").unwrap();
        trie.set(b"doge", b"coin").unwrap();
        trie.set(b"horse", b"stallion").unwrap();
        trie
    }

    #[test]
    fn test_inclusion_proof_verifies() {
        let trie = populated_trie();
        let root = trie.root_hash().unwrap();

        for key in [&b"do"[..], b"dog", b"doge", b"horse"] {
            let value = trie.get(key).unwrap().unwrap();
            let proof = trie.prove(key).unwrap();
            verify_proof(&root, key, Some(value.as_slice()), &proof).unwrap();
        }
    }

    #[test]
    fn test_exclusion_proof_verifies() {
        let trie = populated_trie();
        let root = trie.root_hash().unwrap();

        for key in [&b"dot"[..], b"dogs", b"ho", b"zebra"] {
            assert_eq!(trie.get(key).unwrap(), None);
            let proof = trie.prove(key).unwrap();
            verify_proof(&root, key, None, &proof).unwrap();
        }
    }

    #[test]
    fn test_proof_length_is_traversal_depth() {
        let trie = Trie::new(Arc::new(MemStore::new()));
        trie.set(b"do", b"verb").unwrap();
        trie.set(b"dog", b"puppy").unwrap();

        // Root extension, then branch, then the leaf for "dog".
        assert_eq!(trie.prove(b"dog").unwrap().len(), 3);
        // "do" terminates in the branch's value slot.
        assert_eq!(trie.prove(b"do").unwrap().len(), 2);
    }

    #[test]
    fn test_wrong_value_is_rejected() {
        let trie = populated_trie();
        let root = trie.root_hash().unwrap();
        let proof = trie.prove(b"dog").unwrap();

        assert!(matches!(
            verify_proof(&root, b"dog", Some(b"kitten".as_slice()), &proof),
            Err(ProofError::ValueMismatch)
        ));
        assert!(matches!(
            verify_proof(&root, b"dog", None, &proof),
            Err(ProofError::ValueMismatch)
        ));
    }

    #[test]
    fn test_tampered_element_is_rejected() {
        let trie = populated_trie();
        let root = trie.root_hash().unwrap();
        let proof = trie.prove(b"dog").unwrap();

        for index in 0..proof.len() {
            let mut tampered = proof.clone();
            tampered[index][0] ^= 0x01;
            assert!(
                verify_proof(&root, b"dog", Some(b"puppy".as_slice()), &tampered).is_err(),
                "tampering element {index} must not verify"
            );
        }
    }

    #[test]
    fn test_wrong_root_is_rejected() {
        let trie = populated_trie();
        let proof = trie.prove(b"dog").unwrap();

        assert!(matches!(
            verify_proof(&[0x5a; 32], b"dog", Some(b"puppy".as_slice()), &proof),
            Err(ProofError::HashMismatch(0))
        ));
    }

    #[test]
    fn test_truncated_proof_is_rejected() {
        let trie = populated_trie();
        let root = trie.root_hash().unwrap();
        let mut proof = trie.prove(b"dog").unwrap();
        proof.pop();

        assert!(matches!(
            verify_proof(&root, b"dog", Some(b"puppy".as_slice()), &proof),
            Err(ProofError::Incomplete) | Err(ProofError::HashMismatch(_))
        ));
    }

    #[test]
    fn test_trailing_element_is_rejected() {
        let trie = populated_trie();
        let root = trie.root_hash().unwrap();
        let mut proof = trie.prove(b"dog").unwrap();
        proof.push(proof[0].clone());

        assert!(matches!(
            verify_proof(&root, b"dog", Some(b"puppy".as_slice()), &proof),
            Err(ProofError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_trie_proofs_absence_only() {
        let trie = Trie::new(Arc::new(MemStore::new()));
        let root = trie.root_hash().unwrap();
        let proof = trie.prove(b"anything").unwrap();

        assert!(proof.is_empty());
        verify_proof(&root, b"anything", None, &proof).unwrap();
        assert!(matches!(
            verify_proof(&root, b"anything", Some(b"value".as_slice()), &proof),
            Err(ProofError::ValueMismatch)
        ));
    }

    #[test]
    fn test_single_leaf_proof() {
        let trie = Trie::new(Arc::new(MemStore::new()));
        trie.set(b"only", b"entry").unwrap();
        let root = trie.root_hash().unwrap();

        let proof = trie.prove(b"only").unwrap();
        assert_eq!(proof.len(), 1);
        verify_proof(&root, b"only", Some(b"entry".as_slice()), &proof).unwrap();

        // A different key diverges at the same leaf.
        let proof = trie.prove(b"other").unwrap();
        verify_proof(&root, b"other", None, &proof).unwrap();
    }

    #[test]
    fn test_snapshot_proof_matches_frozen_state() {
        let trie = Trie::new(Arc::new(MemStore::new()));
        trie.set(b"k", b"frozen").unwrap();
        let snapshot = trie.snapshot();
        trie.set(b"k", b"live").unwrap();

        let frozen_root = snapshot.root_hash().unwrap();
        let proof = snapshot.prove(b"k").unwrap();
        verify_proof(&frozen_root, b"k", Some(b"frozen".as_slice()), &proof).unwrap();
    }
}
