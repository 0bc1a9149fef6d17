//! Wallet identity, receipt scanning, and balance bookkeeping.
//!
//! The wallet owns its TXO records and encrypted detail blobs in the
//! key-value store; the commitment mirror is shared read-mostly with every
//! other wallet on the same chain. Scans are serialized per chain and are
//! idempotent over already-seen leaves.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use alloy::primitives::ChainId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info};

use crate::{
    address::ShieldedAddress,
    crypto::{
        aes::{self, Ciphertext},
        keys::{NotePublicKey, ViewKey, bytes_to_fr, fr_to_bytes},
        sha256,
    },
    db::{self, Database, DatabaseError},
    key_derivation::{
        AccountKeypair, CHANGE_SUBTREE, DEFAULT_DERIVATION_PATH, KeyDerivationError, KeyNode,
        PRIMARY_SUBTREE,
    },
    mirror::{CommitmentMirror, CommitmentRecord, StoredPayload},
    note::{Erc20Note, SerializedNote, TokenField},
    transaction::SpendableNote,
};

/// Consecutive unused derivation indices the sweep looks past before
/// giving up.
pub const DEFAULT_GAP_LIMIT: u32 = 5;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wrong wallet encryption key")]
    WrongEncryptionKey,
    #[error("Wallet {0} not found in the store")]
    NotFound(String),
    #[error("No commitment mirror attached for chain {0}")]
    ChainNotAttached(ChainId),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),
}

/// Persisted, encrypted scan progress for one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDetails {
    /// Last scanned leaf count per tree number.
    pub tree_scanned_heights: Vec<u64>,
    /// Highest primary derivation index a note has ever been found at.
    pub primary_height: u32,
    /// Highest change derivation index a note has ever been found at.
    pub change_height: u32,
}

/// A received transaction output, persisted at `(chain, tree, position)`.
///
/// Never deleted; `spend_txid` is set exactly once when the nullifier is
/// observed on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxoRecord {
    pub tree: u32,
    pub position: u32,
    /// Derivation index the owning keypair was found at.
    pub index: u32,
    /// Whether the owning keypair is on the change subtree.
    pub change: bool,
    pub nullifier: [u8; 32],
    pub txid: [u8; 32],
    pub spend_txid: Option<[u8; 32]>,
    pub note: SerializedNote,
}

/// Unspent value grouped under one token.
#[derive(Debug, Clone, Default)]
pub struct TokenBalance {
    pub balance: u128,
    pub utxos: Vec<TxoRecord>,
}

#[derive(Serialize, Deserialize)]
struct MnemonicBlob {
    mnemonic: String,
    derivation_path: String,
}

pub struct Wallet {
    id: String,
    db: Arc<dyn Database>,
    root: KeyNode,
    key_fingerprint: [u8; 32],
    gap_limit: u32,
    mirrors: StdMutex<HashMap<ChainId, Arc<RwLock<CommitmentMirror>>>>,
    scan_locks: StdMutex<HashMap<ChainId, Arc<Mutex<()>>>>,
    scan_events: broadcast::Sender<ChainId>,
}

impl Wallet {
    /// Creates a wallet from a mnemonic, persisting the mnemonic encrypted
    /// under `encryption_key`.
    pub async fn create(
        db: Arc<dyn Database>,
        encryption_key: &[u8; 32],
        mnemonic: &str,
        derivation_path: Option<&str>,
    ) -> Result<Wallet, WalletError> {
        let path = derivation_path.unwrap_or(DEFAULT_DERIVATION_PATH);
        let root = KeyNode::from_mnemonic(mnemonic)?.derive_path(path)?;
        let id = wallet_id(mnemonic, path);

        let blob = MnemonicBlob {
            mnemonic: mnemonic.to_string(),
            derivation_path: path.to_string(),
        };
        let encrypted = encrypt_blob(&blob, encryption_key)?;
        db.put(&mnemonic_key(&id), encrypted).await?;

        info!("Created wallet {id}");
        Ok(Self::assemble(db, id, root, encryption_key))
    }

    /// Loads a wallet by id, decrypting its mnemonic blob. A key that fails
    /// to authenticate the blob is the wrong encryption key.
    pub async fn load(
        db: Arc<dyn Database>,
        encryption_key: &[u8; 32],
        id: &str,
    ) -> Result<Wallet, WalletError> {
        let bytes = db
            .get(&mnemonic_key(id))
            .await?
            .ok_or_else(|| WalletError::NotFound(id.to_string()))?;
        let blob: MnemonicBlob = decrypt_blob(&bytes, encryption_key)?;

        let root = KeyNode::from_mnemonic(&blob.mnemonic)?.derive_path(&blob.derivation_path)?;
        Ok(Self::assemble(db, id.to_string(), root, encryption_key))
    }

    fn assemble(
        db: Arc<dyn Database>,
        id: String,
        root: KeyNode,
        encryption_key: &[u8; 32],
    ) -> Wallet {
        let (scan_events, _) = broadcast::channel(16);
        Wallet {
            id,
            db,
            root,
            key_fingerprint: sha256(encryption_key),
            gap_limit: DEFAULT_GAP_LIMIT,
            mirrors: StdMutex::new(HashMap::new()),
            scan_locks: StdMutex::new(HashMap::new()),
            scan_events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    /// Registers the shared commitment mirror for a chain.
    pub fn attach_chain(&self, chain_id: ChainId, mirror: Arc<RwLock<CommitmentMirror>>) {
        //? Safe to unwrap: the mirror map mutex is never poisoned
        self.mirrors.lock().unwrap().insert(chain_id, mirror);
    }

    /// Completed scans are announced per chain id.
    pub fn subscribe_scans(&self) -> broadcast::Receiver<ChainId> {
        self.scan_events.subscribe()
    }

    /// Keypair at a derivation index of the primary or change subtree.
    pub fn keypair(&self, change: bool, index: u32) -> AccountKeypair {
        let subtree = if change { CHANGE_SUBTREE } else { PRIMARY_SUBTREE };
        self.root
            .derive_hardened(subtree)
            .derive_hardened(index)
            .keypair()
    }

    /// The wallet's receiving address.
    pub fn address(&self, chain_id: Option<ChainId>) -> ShieldedAddress {
        self.keypair(false, 0).address(chain_id)
    }

    /// Symmetric key outgoing shared secrets are wrapped under for audit.
    pub fn view_key(&self) -> ViewKey {
        self.keypair(false, 0).spending_key.view_key()
    }

    /// Recipient key for change outputs.
    pub fn change_pubkey(&self) -> NotePublicKey {
        self.keypair(true, 0).pubkey
    }

    /// A fresh note to this wallet, ready for deposit calldata.
    pub fn create_deposit_note(&self, amount: u128, token: TokenField) -> Erc20Note {
        Erc20Note::new_random(self.keypair(false, 0).pubkey, amount, token)
    }

    /// Scans all new commitments on a chain and persists matching TXOs.
    ///
    /// Serialized per chain: a second concurrent scan for the same chain
    /// observes the lock and returns immediately without error.
    #[tracing::instrument(name = "wallet_scan", skip_all, fields(chain = chain_id))]
    pub async fn scan(
        &self,
        chain_id: ChainId,
        encryption_key: &[u8; 32],
    ) -> Result<(), WalletError> {
        self.check_key(encryption_key)?;

        let lock = {
            //? Safe to unwrap: the lock map mutex is never poisoned
            let mut locks = self.scan_locks.lock().unwrap();
            locks.entry(chain_id).or_default().clone()
        };
        let Ok(_guard) = lock.try_lock() else {
            debug!("Scan already in flight for chain {chain_id}");
            return Ok(());
        };

        let mirror = self.mirror(chain_id)?;
        let mut details = self.load_details(chain_id, encryption_key).await?;
        let original = details.clone();

        // Collect the unseen slice of every tree, then release the mirror.
        let batches = {
            let mirror = mirror.read().await;
            let latest_tree = mirror.latest_tree();
            if details.tree_scanned_heights.len() <= latest_tree as usize {
                details
                    .tree_scanned_heights
                    .resize(latest_tree as usize + 1, 0);
            }

            let mut batches = Vec::new();
            for tree in 0..=latest_tree {
                let scanned = details.tree_scanned_heights[tree as usize] as usize;
                let len = mirror.leaf_count(tree);
                if scanned < len {
                    batches.push((tree, mirror.records_in_range(tree, scanned, len)));
                }
                details.tree_scanned_heights[tree as usize] = len as u64;
            }
            batches
        };

        details.primary_height = self
            .scan_leaves(chain_id, false, details.primary_height, &batches)
            .await?;
        details.change_height = self
            .scan_leaves(chain_id, true, details.change_height, &batches)
            .await?;

        if details != original {
            self.store_details(chain_id, encryption_key, &details).await?;
        }

        info!(
            "Scan complete: primary height {}, change height {}",
            details.primary_height, details.change_height
        );
        let _ = self.scan_events.send(chain_id);
        Ok(())
    }

    /// Gap-limited sweep of one subtree over the new commitment batches.
    ///
    /// Keeps deriving indices until a full `gap_limit` window past the
    /// highest matching index finds nothing; the bound is re-evaluated
    /// every time a match lifts the height.
    async fn scan_leaves(
        &self,
        chain_id: ChainId,
        change: bool,
        mut height: u32,
        batches: &[(u32, Vec<(u32, CommitmentRecord)>)],
    ) -> Result<u32, WalletError> {
        let subtree = self.root.derive_hardened(if change {
            CHANGE_SUBTREE
        } else {
            PRIMARY_SUBTREE
        });

        let mut index = 0u32;
        while index < height + self.gap_limit {
            let keypair = subtree.derive_hardened(index).keypair();

            for (tree, records) in batches {
                for (position, record) in records {
                    let Some(note) = own_note(record, &keypair) else {
                        continue;
                    };

                    self.store_txo(chain_id, *tree, *position, index, change, &keypair, note, record)
                        .await?;
                    height = height.max(index);
                }
            }

            index += 1;
        }

        Ok(height)
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_txo(
        &self,
        chain_id: ChainId,
        tree: u32,
        position: u32,
        index: u32,
        change: bool,
        keypair: &AccountKeypair,
        note: Erc20Note,
        record: &CommitmentRecord,
    ) -> Result<(), WalletError> {
        let key = self.txo_key(chain_id, tree, position);
        if self.db.get(&key).await?.is_some() {
            // Already recorded on a previous scan.
            return Ok(());
        }

        let nullifier = Erc20Note::nullifier(&keypair.spending_key, tree, position);
        let txo = TxoRecord {
            tree,
            position,
            index,
            change,
            nullifier: fr_to_bytes(&nullifier),
            txid: record.txid,
            spend_txid: None,
            note: note.serialize(true),
        };

        info!(
            "Received note of {} at tree {tree} position {position} (index {index}, change {change})",
            txo.note.amount
        );
        self.db.put(&key, db::encode_value(&txo)?).await?;
        Ok(())
    }

    /// All of this wallet's TXO records on a chain, refreshing `spend_txid`
    /// from the mirror's nullifier index on the way out.
    pub async fn txos(&self, chain_id: ChainId) -> Result<Vec<TxoRecord>, WalletError> {
        let mirror = self.mirror(chain_id)?;
        let mirror = mirror.read().await;

        let mut records = Vec::new();
        for (key, value) in self.db.scan_prefix(&self.txo_prefix(chain_id)).await? {
            let mut record: TxoRecord = db::decode_value(&value)?;

            if record.spend_txid.is_none() {
                let nullifier = bytes_to_fr(&record.nullifier);
                if let Some(txid) = mirror.get_nullified(&nullifier) {
                    record.spend_txid = Some(txid.0);
                    self.db.put(&key, db::encode_value(&record)?).await?;
                }
            }

            records.push(record);
        }

        Ok(records)
    }

    /// Unspent value grouped by token.
    pub async fn balances(
        &self,
        chain_id: ChainId,
    ) -> Result<HashMap<TokenField, TokenBalance>, WalletError> {
        let mut balances: HashMap<TokenField, TokenBalance> = HashMap::new();

        for record in self.txos(chain_id).await? {
            if record.spend_txid.is_some() {
                continue;
            }
            let entry = balances.entry(record.note.token).or_default();
            entry.balance += record.note.amount;
            entry.utxos.push(record);
        }

        Ok(balances)
    }

    /// Unspent value grouped by token, then by tree.
    pub async fn balances_by_tree(
        &self,
        chain_id: ChainId,
    ) -> Result<HashMap<TokenField, BTreeMap<u32, TokenBalance>>, WalletError> {
        let mut balances: HashMap<TokenField, BTreeMap<u32, TokenBalance>> = HashMap::new();

        for record in self.txos(chain_id).await? {
            if record.spend_txid.is_some() {
                continue;
            }
            let entry = balances
                .entry(record.note.token)
                .or_default()
                .entry(record.tree)
                .or_default();
            entry.balance += record.note.amount;
            entry.utxos.push(record);
        }

        Ok(balances)
    }

    /// Unspent notes of one token with their spending keys re-derived, in
    /// the form the transaction builder consumes.
    pub async fn spendable_notes(
        &self,
        chain_id: ChainId,
        token: TokenField,
    ) -> Result<Vec<SpendableNote>, WalletError> {
        let mut notes = Vec::new();

        for record in self.txos(chain_id).await? {
            if record.spend_txid.is_some() || record.note.token != token {
                continue;
            }

            let keypair = self.keypair(record.change, record.index);
            //? Safe to unwrap: scanned records always carry their pubkey
            let note = Erc20Note::deserialize(record.note.clone(), None).unwrap();

            notes.push(SpendableNote {
                tree: record.tree,
                position: record.position,
                spending_key: keypair.spending_key,
                note,
            });
        }

        Ok(notes)
    }

    async fn load_details(
        &self,
        chain_id: ChainId,
        encryption_key: &[u8; 32],
    ) -> Result<WalletDetails, WalletError> {
        match self.db.get(&self.details_key(chain_id)).await? {
            Some(bytes) => decrypt_blob(&bytes, encryption_key),
            None => Ok(WalletDetails::default()),
        }
    }

    async fn store_details(
        &self,
        chain_id: ChainId,
        encryption_key: &[u8; 32],
        details: &WalletDetails,
    ) -> Result<(), WalletError> {
        let encrypted = encrypt_blob(details, encryption_key)?;
        self.db.put(&self.details_key(chain_id), encrypted).await?;
        Ok(())
    }

    fn check_key(&self, encryption_key: &[u8; 32]) -> Result<(), WalletError> {
        if sha256(encryption_key) != self.key_fingerprint {
            return Err(WalletError::WrongEncryptionKey);
        }
        Ok(())
    }

    fn mirror(&self, chain_id: ChainId) -> Result<Arc<RwLock<CommitmentMirror>>, WalletError> {
        //? Safe to unwrap: the mirror map mutex is never poisoned
        self.mirrors
            .lock()
            .unwrap()
            .get(&chain_id)
            .cloned()
            .ok_or(WalletError::ChainNotAttached(chain_id))
    }

    fn details_key(&self, chain_id: ChainId) -> String {
        db::join_key(&["wallet", &self.id, &format!("{:0>64}", format!("{chain_id:x}"))])
    }

    fn txo_prefix(&self, chain_id: ChainId) -> String {
        db::join_key(&["txo", &self.id, &db::key_segment(chain_id)]) + ":"
    }

    fn txo_key(&self, chain_id: ChainId, tree: u32, position: u32) -> String {
        db::join_key(&[
            "txo",
            &self.id,
            &db::key_segment(chain_id),
            &db::key_segment(tree as u64),
            &db::key_segment(position as u64),
        ])
    }
}

/// Whether a stored commitment belongs to `keypair`, and the decrypted note
/// if so. Cryptographic failures skip the single leaf.
fn own_note(record: &CommitmentRecord, keypair: &AccountKeypair) -> Option<Erc20Note> {
    match &record.payload {
        StoredPayload::Generated { note } => {
            (note.pubkey == keypair.pubkey).then(|| note.clone())
        }
        StoredPayload::Encrypted {
            ciphertext,
            sender_pubkey,
        } => {
            let shared = keypair.spending_key.shared_secret(sender_pubkey).ok()?;
            let note = Erc20Note::decrypt(ciphertext, &shared).ok()?;
            (note.pubkey == keypair.pubkey).then_some(note)
        }
    }
}

fn wallet_id(mnemonic: &str, path: &str) -> String {
    let mut data = Vec::new();
    data.extend_from_slice(mnemonic.as_bytes());
    data.push(b':');
    data.extend_from_slice(path.as_bytes());
    hex::encode(sha256(&data))
}

fn mnemonic_key(id: &str) -> String {
    db::join_key(&["wallet", id])
}

fn encrypt_blob<T: Serialize>(
    value: &T,
    encryption_key: &[u8; 32],
) -> Result<Vec<u8>, WalletError> {
    let plaintext = db::encode_value(value)?;
    let ciphertext = aes::encrypt_gcm(&plaintext, encryption_key)
        .map_err(|e| DatabaseError::Corrupted(e.to_string()))?;
    db::encode_value(&ciphertext).map_err(WalletError::from)
}

fn decrypt_blob<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    encryption_key: &[u8; 32],
) -> Result<T, WalletError> {
    let ciphertext: Ciphertext = db::decode_value(bytes)?;
    let plaintext = aes::decrypt_gcm(&ciphertext, encryption_key)
        .map_err(|_| WalletError::WrongEncryptionKey)?;
    db::decode_value(&plaintext).map_err(WalletError::from)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use crate::crypto::keys::SpendingKey;

    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const TEST_KEY: [u8; 32] = [7u8; 32];

    async fn test_wallet() -> Wallet {
        Wallet::create(Arc::new(db::MemoryDatabase::new()), &TEST_KEY, TEST_MNEMONIC, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_create_and_load_roundtrip() {
        let db = Arc::new(db::MemoryDatabase::new());

        let created = Wallet::create(db.clone(), &TEST_KEY, TEST_MNEMONIC, None)
            .await
            .unwrap();
        let loaded = Wallet::load(db, &TEST_KEY, created.id()).await.unwrap();

        assert_eq!(created.address(Some(1)), loaded.address(Some(1)));
        assert_eq!(created.change_pubkey(), loaded.change_pubkey());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_load_with_wrong_key_fails() {
        let db = Arc::new(db::MemoryDatabase::new());

        let created = Wallet::create(db.clone(), &TEST_KEY, TEST_MNEMONIC, None)
            .await
            .unwrap();
        let result = Wallet::load(db, &[8u8; 32], created.id()).await;

        assert!(matches!(result, Err(WalletError::WrongEncryptionKey)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_scan_rejects_wrong_key() {
        let wallet = test_wallet().await;
        let result = wallet.scan(1, &[8u8; 32]).await;
        assert!(matches!(result, Err(WalletError::WrongEncryptionKey)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_scan_requires_attached_chain() {
        let wallet = test_wallet().await;
        let result = wallet.scan(1, &TEST_KEY).await;
        assert!(matches!(result, Err(WalletError::ChainNotAttached(1))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_keypairs_are_stable_per_subtree() {
        let wallet = test_wallet().await;

        assert_eq!(wallet.keypair(false, 3), wallet.keypair(false, 3));
        assert_ne!(
            wallet.keypair(false, 3).pubkey,
            wallet.keypair(true, 3).pubkey
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_own_note_matches_only_owner() {
        let wallet = test_wallet().await;
        let keypair = wallet.keypair(false, 0);

        let note = Erc20Note::new_random(keypair.pubkey, 100, TokenField::new([1u8; 32]));
        let record = CommitmentRecord {
            payload: StoredPayload::Generated { note: note.clone() },
            txid: [0u8; 32],
        };

        assert_eq!(own_note(&record, &keypair), Some(note.clone()));

        let other = AccountKeypair {
            spending_key: SpendingKey::from_seed(b"other"),
            pubkey: SpendingKey::from_seed(b"other").public_key(),
        };
        assert_eq!(own_note(&record, &other), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_own_note_decrypts_encrypted_commitment() {
        let wallet = test_wallet().await;
        let keypair = wallet.keypair(false, 2);

        let note = Erc20Note::new_random(keypair.pubkey, 250, TokenField::new([1u8; 32]));
        let sender = SpendingKey::from_seed(b"sender");
        let shared = sender.shared_secret(&note.pubkey).unwrap();

        let record = CommitmentRecord {
            payload: StoredPayload::Encrypted {
                ciphertext: note.encrypt(&shared),
                sender_pubkey: sender.public_key(),
            },
            txid: [0u8; 32],
        };

        assert_eq!(own_note(&record, &keypair), Some(note));
        assert_eq!(own_note(&record, &wallet.keypair(false, 3)), None);
    }
}
