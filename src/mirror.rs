//! Shared per-chain mirror of the on-chain commitment state: one append-only
//! tree per tree number, the contract's bounded ring of historical roots, and
//! the nullifier index for observed spends.
//!
//! One mirror instance is shared read-mostly across every wallet scanning the
//! same chain.

use std::collections::{BTreeMap, HashMap, VecDeque};

use alloy::primitives::{B256, ChainId};
use ark_bn254::Fr;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    contract::{CommitmentEvent, EncryptedNote},
    crypto::{
        aes::CiphertextCtr,
        keys::{NotePublicKey, bytes_to_fr, fr_to_bytes},
    },
    db::{Database, DatabaseError},
    merkle_tree::{MerkleProof, MerkleTree, MerkleTreeError, MerkleTreeState, TOTAL_LEAVES},
    note::Erc20Note,
};

/// Number of historical roots the contract retains per tree. The mirror
/// keeps the same ring so proofs are only built against roots the contract
/// will still accept.
pub const ROOT_HISTORY_CAPACITY: usize = 120;

pub struct CommitmentMirror {
    chain_id: ChainId,
    trees: BTreeMap<u32, TreeEntry>,
    records: BTreeMap<u32, BTreeMap<u32, CommitmentRecord>>,
    nullifiers: HashMap<[u8; 32], B256>,
}

struct TreeEntry {
    tree: MerkleTree,
    known_roots: VecDeque<[u8; 32]>,
}

/// The scan-relevant payload stored alongside each leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredPayload {
    /// Cleartext deposit preimage.
    Generated { note: Erc20Note },
    /// Encrypted transfer output.
    Encrypted {
        ciphertext: CiphertextCtr,
        sender_pubkey: NotePublicKey,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentRecord {
    pub payload: StoredPayload,
    pub txid: [u8; 32],
}

#[derive(Serialize, Deserialize)]
pub struct CommitmentMirrorState {
    pub chain_id: ChainId,
    pub trees: BTreeMap<u32, MerkleTreeState>,
    pub known_roots: BTreeMap<u32, Vec<[u8; 32]>>,
    pub records: BTreeMap<u32, BTreeMap<u32, CommitmentRecord>>,
    pub nullifiers: Vec<([u8; 32], [u8; 32])>,
}

impl CommitmentMirror {
    pub fn new(chain_id: ChainId) -> Self {
        CommitmentMirror {
            chain_id,
            trees: BTreeMap::new(),
            records: BTreeMap::new(),
            nullifiers: HashMap::new(),
        }
    }

    pub fn from_state(state: CommitmentMirrorState) -> Self {
        let mut trees = BTreeMap::new();
        for (number, tree_state) in state.trees {
            let known_roots = state
                .known_roots
                .get(&number)
                .map(|roots| roots.iter().copied().collect())
                .unwrap_or_default();

            trees.insert(
                number,
                TreeEntry {
                    tree: MerkleTree::from_state(tree_state),
                    known_roots,
                },
            );
        }

        CommitmentMirror {
            chain_id: state.chain_id,
            trees,
            records: state.records,
            nullifiers: state
                .nullifiers
                .into_iter()
                .map(|(k, v)| (k, B256::from(v)))
                .collect(),
        }
    }

    pub fn state(&self) -> CommitmentMirrorState {
        let mut trees = BTreeMap::new();
        let mut known_roots = BTreeMap::new();
        for (number, entry) in self.trees.iter() {
            trees.insert(*number, entry.tree.state());
            known_roots.insert(*number, entry.known_roots.iter().copied().collect());
        }

        CommitmentMirrorState {
            chain_id: self.chain_id,
            trees,
            known_roots,
            records: self.records.clone(),
            nullifiers: self.nullifiers.iter().map(|(k, v)| (*k, v.0)).collect(),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Highest tree number with any appended leaves, or 0 for a fresh chain.
    pub fn latest_tree(&self) -> u32 {
        self.trees.keys().next_back().copied().unwrap_or(0)
    }

    pub fn leaf_count(&self, tree_number: u32) -> usize {
        self.trees
            .get(&tree_number)
            .map(|entry| entry.tree.leaf_count())
            .unwrap_or(0)
    }

    pub fn leaves_in_range(&self, tree_number: u32, start: usize, end: usize) -> Vec<Fr> {
        self.trees
            .get(&tree_number)
            .map(|entry| entry.tree.leaves_in_range(start, end))
            .unwrap_or_default()
    }

    /// Applies one observed commitment batch: appends the leaves and stores
    /// the scan-relevant payloads at their positions.
    pub fn apply(&mut self, event: &CommitmentEvent) {
        match event {
            CommitmentEvent::Generated {
                tree,
                start_position,
                notes,
                txid,
            } => {
                let mut leaves = Vec::with_capacity(notes.len());
                for (i, note) in notes.iter().enumerate() {
                    let position = *start_position as usize + i;
                    let leaf = note
                        .as_ref()
                        .map(|note| match note.commitment() {
                            Ok(leaf) => {
                                self.insert_record(
                                    *tree,
                                    position,
                                    CommitmentRecord {
                                        payload: StoredPayload::Generated { note: note.clone() },
                                        txid: txid.0,
                                    },
                                );
                                Some(leaf)
                            }
                            Err(e) => {
                                warn!("Deposit commitment at position {position} invalid: {e}");
                                None
                            }
                        })
                        .flatten();

                    // The on-chain tree still holds a leaf here; a zero
                    // placeholder keeps later positions aligned.
                    leaves.push(leaf.unwrap_or(Fr::from(0u64)));
                }
                self.append(*tree, *start_position as usize, &leaves);
            }
            CommitmentEvent::Encrypted {
                tree,
                start_position,
                commitments,
                txid,
            } => {
                let mut leaves = Vec::with_capacity(commitments.len());
                for (i, commitment) in commitments.iter().enumerate() {
                    let EncryptedNote {
                        hash,
                        ciphertext,
                        sender_pubkey,
                    } = commitment;

                    self.insert_record(
                        *tree,
                        *start_position as usize + i,
                        CommitmentRecord {
                            payload: StoredPayload::Encrypted {
                                ciphertext: ciphertext.clone(),
                                sender_pubkey: *sender_pubkey,
                            },
                            txid: txid.0,
                        },
                    );
                    leaves.push(*hash);
                }
                self.append(*tree, *start_position as usize, &leaves);
            }
        }
    }

    /// Stored payloads for positions `[start, end)` of a tree.
    pub fn records_in_range(
        &self,
        tree_number: u32,
        start: usize,
        end: usize,
    ) -> Vec<(u32, CommitmentRecord)> {
        let Some(records) = self.records.get(&tree_number) else {
            return Vec::new();
        };
        records
            .range(start as u32..end as u32)
            .map(|(position, record)| (*position, record.clone()))
            .collect()
    }

    fn insert_record(&mut self, tree_number: u32, position: usize, record: CommitmentRecord) {
        let tree = tree_number + (position / TOTAL_LEAVES) as u32;
        let position = (position % TOTAL_LEAVES) as u32;
        self.records
            .entry(tree)
            .or_default()
            .insert(position, record);
    }

    /// Appends a batch of commitments starting at `start_position`,
    /// rolling into the next tree number when a tree fills up.
    pub fn append(&mut self, tree_number: u32, start_position: usize, leaves: &[Fr]) {
        let mut remaining = leaves;
        let mut current_tree = tree_number + (start_position / TOTAL_LEAVES) as u32;
        let mut position = start_position % TOTAL_LEAVES;

        while !remaining.is_empty() {
            let space_in_tree = TOTAL_LEAVES - position;
            let to_insert = remaining.len().min(space_in_tree);

            let entry = self
                .trees
                .entry(current_tree)
                .or_insert_with(|| TreeEntry::new(current_tree));
            entry.tree.insert_leaves(&remaining[..to_insert], position);
            entry.push_root();

            remaining = &remaining[to_insert..];
            current_tree += 1;
            position = 0;
        }
    }

    pub fn root(&mut self, tree_number: u32) -> Fr {
        self.trees
            .entry(tree_number)
            .or_insert_with(|| TreeEntry::new(tree_number))
            .tree
            .root()
    }

    pub fn proof(
        &mut self,
        tree_number: u32,
        position: usize,
    ) -> Result<MerkleProof, MerkleTreeError> {
        self.trees
            .entry(tree_number)
            .or_insert_with(|| TreeEntry::new(tree_number))
            .tree
            .generate_proof(position)
    }

    /// Whether `root` is still inside the contract's retained history for
    /// the given tree.
    pub fn known_root(&self, tree_number: u32, root: Fr) -> bool {
        let bytes = fr_to_bytes(&root);
        self.trees
            .get(&tree_number)
            .map(|entry| entry.known_roots.iter().any(|r| *r == bytes))
            .unwrap_or(false)
    }

    pub fn known_roots(&self, tree_number: u32) -> Vec<Fr> {
        self.trees
            .get(&tree_number)
            .map(|entry| entry.known_roots.iter().map(bytes_to_fr).collect())
            .unwrap_or_default()
    }

    /// Persists the mirror under its chain's key.
    pub async fn store(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        let state = self.state();
        db.put(&mirror_key(self.chain_id), crate::db::encode_value(&state)?)
            .await
    }

    /// Loads a chain's mirror from the store, if one was persisted.
    pub async fn load(
        db: &dyn Database,
        chain_id: ChainId,
    ) -> Result<Option<CommitmentMirror>, DatabaseError> {
        match db.get(&mirror_key(chain_id)).await? {
            Some(bytes) => {
                let state: CommitmentMirrorState = crate::db::decode_value(&bytes)?;
                Ok(Some(CommitmentMirror::from_state(state)))
            }
            None => Ok(None),
        }
    }

    pub fn mark_nullified(&mut self, nullifier: Fr, txid: B256) {
        let key = fr_to_bytes(&nullifier);
        if self.nullifiers.insert(key, txid).is_none() {
            info!(
                "Observed nullifier {} in tx {txid} on chain {}",
                hex::encode(key),
                self.chain_id
            );
        }
    }

    pub fn get_nullified(&self, nullifier: &Fr) -> Option<B256> {
        self.nullifiers.get(&fr_to_bytes(nullifier)).copied()
    }
}

fn mirror_key(chain_id: ChainId) -> String {
    crate::db::join_key(&["merkle", &crate::db::key_segment(chain_id)])
}

impl TreeEntry {
    fn new(number: u32) -> Self {
        // The contract seeds its root history with the empty-tree root at
        // deployment; the mirror's ring starts the same way.
        let mut entry = TreeEntry {
            tree: MerkleTree::new(number),
            known_roots: VecDeque::new(),
        };
        entry.push_root();
        entry
    }

    fn push_root(&mut self) {
        let root = fr_to_bytes(&self.tree.root());
        if self.known_roots.back() == Some(&root) {
            return;
        }
        self.known_roots.push_back(root);
        while self.known_roots.len() > ROOT_HISTORY_CAPACITY {
            self.known_roots.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn test_append_tracks_roots() {
        let mut mirror = CommitmentMirror::new(1);

        mirror.append(0, 0, &[Fr::from(1u64), Fr::from(2u64)]);
        let first_root = mirror.root(0);
        assert!(mirror.known_root(0, first_root));

        mirror.append(0, 2, &[Fr::from(3u64)]);
        let second_root = mirror.root(0);

        // Both batch roots stay in the ring.
        assert!(mirror.known_root(0, first_root));
        assert!(mirror.known_root(0, second_root));
        assert!(!mirror.known_root(0, Fr::from(99u64)));
    }

    #[test]
    #[traced_test]
    fn test_root_ring_is_bounded() {
        let mut mirror = CommitmentMirror::new(1);

        mirror.append(0, 0, &[Fr::from(1u64)]);
        let first_root = mirror.root(0);

        for i in 1..=(ROOT_HISTORY_CAPACITY as u64) {
            mirror.append(0, i as usize, &[Fr::from(i + 1)]);
        }

        assert!(!mirror.known_root(0, first_root));
        let current = mirror.root(0);
        assert!(mirror.known_root(0, current));
    }

    #[test]
    #[traced_test]
    fn test_append_crosses_tree_boundary() {
        let mut mirror = CommitmentMirror::new(1);

        let leaves: Vec<Fr> = (0..3).map(|i| Fr::from(i as u64 + 1)).collect();
        mirror.append(0, TOTAL_LEAVES - 2, &leaves);

        assert_eq!(mirror.leaf_count(0), TOTAL_LEAVES);
        assert_eq!(mirror.leaf_count(1), 1);
        assert_eq!(mirror.latest_tree(), 1);
    }

    #[test]
    #[traced_test]
    fn test_nullifier_index() {
        let mut mirror = CommitmentMirror::new(1);
        let nullifier = Fr::from(42u64);
        let txid = B256::repeat_byte(7);

        assert_eq!(mirror.get_nullified(&nullifier), None);
        mirror.mark_nullified(nullifier, txid);
        assert_eq!(mirror.get_nullified(&nullifier), Some(txid));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_and_load() {
        let db = crate::db::MemoryDatabase::new();

        let mut mirror = CommitmentMirror::new(5);
        mirror.append(0, 0, &[Fr::from(1u64)]);
        let root = mirror.root(0);
        mirror.store(&db).await.unwrap();

        let mut loaded = CommitmentMirror::load(&db, 5).await.unwrap().unwrap();
        assert_eq!(loaded.root(0), root);

        assert!(CommitmentMirror::load(&db, 6).await.unwrap().is_none());
    }

    #[test]
    #[traced_test]
    fn test_apply_generated_batch_keeps_positions_aligned() {
        use crate::{crypto::keys::SpendingKey, note::TokenField};

        let mut mirror = CommitmentMirror::new(1);

        let note = crate::note::Erc20Note::new(
            SpendingKey::from_seed(b"owner").public_key(),
            [1u8; 16],
            500,
            TokenField::new([2u8; 32]),
        );

        // A malformed preimage occupies position 0; the valid note lands at
        // position 1 regardless.
        mirror.apply(&CommitmentEvent::Generated {
            tree: 0,
            start_position: 0,
            notes: vec![None, Some(note.clone())],
            txid: B256::repeat_byte(9),
        });

        assert_eq!(mirror.leaf_count(0), 2);
        assert_eq!(
            mirror.leaves_in_range(0, 1, 2),
            vec![note.commitment().unwrap()]
        );

        let records = mirror.records_in_range(0, 0, 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 1);
        assert!(matches!(
            &records[0].1.payload,
            StoredPayload::Generated { note: stored } if *stored == note
        ));
        assert_eq!(records[0].1.txid, [9u8; 32]);
    }

    #[test]
    #[traced_test]
    fn test_state_roundtrip() {
        let mut mirror = CommitmentMirror::new(137);
        mirror.append(0, 0, &[Fr::from(5u64), Fr::from(6u64)]);
        mirror.mark_nullified(Fr::from(9u64), B256::repeat_byte(1));
        let root = mirror.root(0);

        let mut rebuilt = CommitmentMirror::from_state(mirror.state());

        assert_eq!(rebuilt.chain_id(), 137);
        assert_eq!(rebuilt.root(0), root);
        assert!(rebuilt.known_root(0, root));
        assert_eq!(
            rebuilt.get_nullified(&Fr::from(9u64)),
            Some(B256::repeat_byte(1))
        );
    }
}
