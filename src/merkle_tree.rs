use ark_bn254::Fr;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{
    keys::{bytes_to_fr, fr_to_bytes},
    poseidon::poseidon_hash,
};

/// Depth of the on-chain ERC-20 commitment trees.
pub const TREE_DEPTH: usize = 16;

/// Leaf capacity of a single tree. Appends past this boundary roll into the
/// next tree number.
pub const TOTAL_LEAVES: usize = 1 << TREE_DEPTH;

/// Append-only mirror of one on-chain commitment tree.
///
/// Leaves only ever land at or past the previous write position, so
/// staleness is tracked as a single watermark: the lowest leaf index
/// touched since the last rebuild. A rebuild rehashes the cone above that
/// watermark and nothing else. Levels grow lazily; a parent slot opened by
/// growth starts out as the zero-subtree root for its height, which is
/// already correct for all-empty children.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    number: u32,
    depth: usize,
    /// `zeros[h]` is the root of an all-empty subtree of height `h`.
    zeros: Vec<Fr>,
    /// `levels[0]` holds the leaves; `levels[depth]` the root.
    levels: Vec<Vec<Fr>>,
    /// Lowest leaf index with stale ancestors, if any.
    dirty_from: Option<usize>,
}

/// Serialized form of a tree: the leaf sequence alone. Internal nodes are
/// recomputed on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleTreeState {
    pub number: u32,
    pub depth: usize,
    pub leaves: Vec<[u8; 32]>,
}

pub struct MerkleProof {
    pub element: Fr,
    pub elements: Vec<Fr>,
    pub indices: u32,
    pub root: Fr,
}

#[derive(Debug, Error)]
pub enum MerkleTreeError {
    #[error("Leaf position {0} is beyond the end of the tree")]
    PositionOutOfRange(usize),
}

impl MerkleTree {
    pub fn new(tree_number: u32) -> Self {
        Self::new_with_depth(tree_number, TREE_DEPTH)
    }

    pub fn new_with_depth(tree_number: u32, depth: usize) -> Self {
        MerkleTree {
            number: tree_number,
            depth,
            zeros: zero_subtree_roots(depth),
            levels: vec![Vec::new(); depth + 1],
            dirty_from: None,
        }
    }

    pub fn from_state(state: MerkleTreeState) -> Self {
        let mut tree = Self::new_with_depth(state.number, state.depth);
        tree.levels[0] = state.leaves.iter().map(bytes_to_fr).collect();
        tree.dirty_from = (!tree.levels[0].is_empty()).then_some(0);
        tree
    }

    pub fn state(&self) -> MerkleTreeState {
        MerkleTreeState {
            number: self.number,
            depth: self.depth,
            leaves: self.levels[0].iter().map(fr_to_bytes).collect(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn leaf(&self, position: usize) -> Option<Fr> {
        self.levels[0].get(position).copied()
    }

    /// Leaves in `[start, end)`, clamped to the current tree size.
    pub fn leaves_in_range(&self, start: usize, end: usize) -> Vec<Fr> {
        let end = end.min(self.levels[0].len());
        if start >= end {
            return Vec::new();
        }
        self.levels[0][start..end].to_vec()
    }

    pub fn root(&mut self) -> Fr {
        self.rebuild();
        self.levels[self.depth]
            .first()
            .copied()
            .unwrap_or(self.zeros[self.depth])
    }

    pub fn insert_leaves(&mut self, leaves: &[Fr], start_position: usize) {
        if leaves.is_empty() {
            return;
        }

        let end = start_position + leaves.len();
        if self.levels[0].len() < end {
            // Positions skipped over hold the empty leaf; their ancestors
            // already evaluate to the matching zero-subtree roots.
            self.levels[0].resize(end, self.zeros[0]);
        }
        self.levels[0][start_position..end].copy_from_slice(leaves);

        self.dirty_from = Some(match self.dirty_from {
            Some(watermark) => watermark.min(start_position),
            None => start_position,
        });
    }

    /// Builds an inclusion proof for the leaf at `position`.
    ///
    /// Proofs are addressed by position rather than by element: identical
    /// commitments may appear at multiple positions and each spend binds to
    /// exactly one of them.
    pub fn generate_proof(&mut self, position: usize) -> Result<MerkleProof, MerkleTreeError> {
        self.rebuild();

        if position >= self.levels[0].len() {
            return Err(MerkleTreeError::PositionOutOfRange(position));
        }

        let mut elements = Vec::with_capacity(self.depth);
        let mut index = position;

        for level in 0..self.depth {
            let sibling = self.levels[level]
                .get(index ^ 1)
                .copied()
                .unwrap_or(self.zeros[level]);
            elements.push(sibling);
            index /= 2;
        }

        Ok(MerkleProof {
            element: self.levels[0][position],
            elements,
            indices: position as u32,
            root: self.levels[self.depth]
                .first()
                .copied()
                .unwrap_or(self.zeros[self.depth]),
        })
    }

    pub fn validate_proof(proof: &MerkleProof) -> bool {
        reconstruct_root(&proof.elements, proof.indices, proof.element) == proof.root
    }

    /// Rehashes every ancestor at or above the dirty watermark, one level
    /// at a time. The watermark halves with each level, so the rehashed
    /// span narrows to a single node at the root.
    fn rebuild(&mut self) {
        let Some(mut watermark) = self.dirty_from.take() else {
            return;
        };

        debug!(
            "Rebuilding tree {} above leaf {watermark}",
            self.number
        );

        for level in 0..self.depth {
            watermark /= 2;

            let (lower, upper) = self.levels.split_at_mut(level + 1);
            let children = &lower[level];
            let parents = &mut upper[0];

            let parent_len = children.len().div_ceil(2);
            if parents.len() < parent_len {
                parents.resize(parent_len, self.zeros[level + 1]);
            }

            let empty_child = self.zeros[level];
            let rehashed: Vec<Fr> = (watermark..parent_len)
                .into_par_iter()
                .map(|parent| {
                    let left = children[2 * parent];
                    let right = children
                        .get(2 * parent + 1)
                        .copied()
                        .unwrap_or(empty_child);
                    hash_pair(left, right)
                })
                .collect();
            parents[watermark..parent_len].copy_from_slice(&rehashed);
        }
    }
}

/// Recomputes the root implied by a sibling path, an index, and a leaf.
pub fn reconstruct_root(elements: &[Fr], indices: u32, leaf: Fr) -> Fr {
    let mut current_hash = leaf;
    let mut idx = indices;

    for &sibling in elements {
        let is_left_child = idx & 1 == 0;
        current_hash = if is_left_child {
            hash_pair(current_hash, sibling)
        } else {
            hash_pair(sibling, current_hash)
        };
        idx >>= 1;
    }

    current_hash
}

/// Roots of all-empty subtrees of height `0..=depth`. The protocol's empty
/// leaf is the zero word.
fn zero_subtree_roots(depth: usize) -> Vec<Fr> {
    let mut roots = vec![Fr::from(0u64)];
    for height in 0..depth {
        let below = roots[height];
        roots.push(hash_pair(below, below));
    }
    roots
}

fn hash_pair(left: Fr, right: Fr) -> Fr {
    poseidon_hash(&[left, right])
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn test_empty_root_is_zero_subtree_root() {
        let mut tree = MerkleTree::new(0);

        let mut expected = Fr::from(0u64);
        for _ in 0..TREE_DEPTH {
            expected = hash_pair(expected, expected);
        }

        assert_eq!(tree.root(), expected);
    }

    #[test]
    #[traced_test]
    fn test_insert_and_proof() {
        let mut tree = MerkleTree::new(0);
        let leaves: Vec<Fr> = (0..10).map(|i| Fr::from(i as u64 + 1)).collect();

        tree.insert_leaves(&leaves, 0);

        for position in 0..leaves.len() {
            let proof = tree.generate_proof(position).unwrap();
            assert_eq!(proof.element, leaves[position]);
            assert_eq!(proof.elements.len(), TREE_DEPTH);
            assert!(MerkleTree::validate_proof(&proof));
        }
    }

    #[test]
    #[traced_test]
    fn test_proof_out_of_range() {
        let mut tree = MerkleTree::new(0);
        tree.insert_leaves(&[Fr::from(1u64)], 0);

        assert!(matches!(
            tree.generate_proof(1),
            Err(MerkleTreeError::PositionOutOfRange(1))
        ));
    }

    #[test]
    #[traced_test]
    fn test_duplicate_leaves_get_distinct_proofs() {
        let mut tree = MerkleTree::new(0);
        let leaf = Fr::from(77u64);
        tree.insert_leaves(&[leaf, leaf], 0);

        let first = tree.generate_proof(0).unwrap();
        let second = tree.generate_proof(1).unwrap();

        assert_eq!(first.indices, 0);
        assert_eq!(second.indices, 1);
        assert!(MerkleTree::validate_proof(&first));
        assert!(MerkleTree::validate_proof(&second));
    }

    #[test]
    #[traced_test]
    fn test_state_roundtrip() {
        let mut tree = MerkleTree::new(3);
        let leaves: Vec<Fr> = (0..10).map(|i| Fr::from(i as u64 + 1)).collect();
        tree.insert_leaves(&leaves, 0);

        let state = tree.state();
        assert_eq!(state.leaves.len(), 10);

        let mut rebuilt = MerkleTree::from_state(state);
        assert_eq!(tree.root(), rebuilt.root());
        assert_eq!(rebuilt.number(), 3);
    }

    #[test]
    #[traced_test]
    fn test_staged_inserts_match_single_batch() {
        // A rebuild between two writes must leave the same root as writing
        // everything at once: the watermark has to cover the second write's
        // whole ancestor cone even though the first cone was already hashed.
        let commitments: Vec<Fr> = (1..=9).map(|i| Fr::from(i as u64)).collect();

        let mut staged = MerkleTree::new(0);
        staged.insert_leaves(&commitments[..4], 0);
        let _ = staged.root();
        staged.insert_leaves(&commitments[4..], 4);

        let mut oneshot = MerkleTree::new(0);
        oneshot.insert_leaves(&commitments, 0);

        assert_eq!(staged.root(), oneshot.root());
    }

    #[test]
    #[traced_test]
    fn test_sparse_insert_fills_gap_with_empty_leaves() {
        // Writing past the end pads the gap with zero leaves; the result
        // matches writing those zeros explicitly.
        let mut sparse = MerkleTree::new(0);
        sparse.insert_leaves(&[Fr::from(5u64)], 6);

        let mut dense = MerkleTree::new(0);
        let mut all = vec![Fr::from(0u64); 6];
        all.push(Fr::from(5u64));
        dense.insert_leaves(&all, 0);

        assert_eq!(sparse.root(), dense.root());
        assert_eq!(sparse.leaf_count(), 7);
    }

    #[test]
    #[traced_test]
    fn test_overwrite_low_position_after_rebuild() {
        // Rewriting an early leaf after later leaves were hashed must pull
        // the watermark back down.
        let mut tree = MerkleTree::new(0);
        tree.insert_leaves(&[Fr::from(1u64), Fr::from(2u64), Fr::from(3u64)], 0);
        let _ = tree.root();

        tree.insert_leaves(&[Fr::from(9u64)], 0);

        let mut expected = MerkleTree::new(0);
        expected.insert_leaves(&[Fr::from(9u64), Fr::from(2u64), Fr::from(3u64)], 0);

        assert_eq!(tree.root(), expected.root());
    }
}
