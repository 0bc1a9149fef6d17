//! On-chain boundary: event decoding, historical replay, and calldata
//! serialization for the shielded-pool contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use alloy::{
    primitives::{B256, U256},
    providers::{DynProvider, Provider},
    rpc::types::{Filter, Log},
};
use alloy_sol_types::{SolCall, SolEvent, sol};
use ark_bn254::Fr;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    chain_config::ChainConfig,
    crypto::{
        aes::CiphertextCtr,
        keys::{NotePublicKey, u256_to_fr},
    },
    db::{Database, DatabaseError},
    note::{Erc20Note, MAX_NOTE_AMOUNT, NoteError, TokenField},
};

/// Blocks per historical replay chunk.
pub const SCAN_CHUNK_SIZE: u64 = 500;
/// Attempts per chunk before the replay surfaces the failure.
pub const MAX_CHUNK_RETRIES: u32 = 5;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

sol! {
    #[sol(rpc)]
    contract RailgunLogic {
        #[derive(Debug)]
        event GeneratedCommitmentBatch(
            uint256 treeNumber,
            uint256 startPosition,
            CommitmentPreimage[] commitments
        );
        #[derive(Debug)]
        event CommitmentBatch(
            uint256 treeNumber,
            uint256 startPosition,
            EncryptedCommitment[] commitments
        );
        #[derive(Debug)]
        event Nullifier(uint256 nullifier);

        function generateDeposit(CommitmentPreimage[] calldata _commitments) external;
        function transact(Transaction[] calldata _transactions) external;
    }

    /// Cleartext deposit leaf preimage.
    #[derive(Debug)]
    struct CommitmentPreimage {
        uint256[2] pubkey;
        uint256 random;
        uint256 amount;
        uint8 tokenType;
        uint256 tokenSubID;
        uint256 token;
    }

    /// Encrypted transfer leaf as emitted by `transact`.
    #[derive(Debug)]
    struct EncryptedCommitment {
        uint256 hash;
        // iv word followed by the three note blocks
        uint256[4] ciphertext;
        uint256[2] senderPubKey;
        uint256[2] revealKey;
    }

    #[derive(Debug)]
    struct G1Point {
        uint256 x;
        uint256 y;
    }

    #[derive(Debug)]
    struct G2Point {
        uint256[2] x;
        uint256[2] y;
    }

    #[derive(Debug)]
    struct SnarkProof {
        G1Point a;
        G2Point b;
        G1Point c;
    }

    #[derive(Debug)]
    struct CommitmentOut {
        uint256 hash;
        uint256[] ciphertext;
        uint256[2] senderPubKey;
        uint256[] revealKey;
    }

    #[derive(Debug)]
    struct Transaction {
        SnarkProof proof;
        address adaptIDcontract;
        uint256 adaptIDparameters;
        uint120 depositAmount;
        uint120 withdrawAmount;
        uint8 tokenType;
        uint256 tokenSubID;
        uint256 tokenField;
        address outputEthAddress;
        uint256 treeNumber;
        uint256 merkleRoot;
        uint256[] nullifiers;
        CommitmentOut[] commitmentsOut;
    }
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Error decoding log: {0}")]
    LogDecode(#[from] alloy_sol_types::Error),
    #[error("RPC retries exhausted for blocks {from}..={to}: {source}")]
    RpcRetryExhausted {
        from: u64,
        to: u64,
        source: alloy_contract::Error,
    },
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// A commitment batch observed on-chain, normalized for the mirror and the
/// wallet scanner.
#[derive(Debug, Clone)]
pub enum CommitmentEvent {
    /// Cleartext deposit commitments. A `None` entry is a malformed
    /// preimage: its position is preserved so later leaves stay aligned.
    Generated {
        tree: u32,
        start_position: u32,
        notes: Vec<Option<Erc20Note>>,
        txid: B256,
    },
    /// Encrypted transfer commitments.
    Encrypted {
        tree: u32,
        start_position: u32,
        commitments: Vec<EncryptedNote>,
        txid: B256,
    },
}

#[derive(Debug, Clone)]
pub struct EncryptedNote {
    pub hash: Fr,
    pub ciphertext: CiphertextCtr,
    pub sender_pubkey: NotePublicKey,
}

#[derive(Debug, Clone)]
pub enum ChainEvent {
    Commitment(CommitmentEvent),
    Nullifier { nullifier: Fr, txid: B256 },
}

impl CommitmentEvent {
    pub fn tree(&self) -> u32 {
        match self {
            CommitmentEvent::Generated { tree, .. } => *tree,
            CommitmentEvent::Encrypted { tree, .. } => *tree,
        }
    }

    pub fn start_position(&self) -> u32 {
        match self {
            CommitmentEvent::Generated { start_position, .. } => *start_position,
            CommitmentEvent::Encrypted { start_position, .. } => *start_position,
        }
    }
}

/// Converts a deposit preimage into a note.
///
/// Fails `MalformedNote` on out-of-range amounts; a bad preimage skips one
/// leaf, never the whole batch.
pub fn note_from_preimage(preimage: &CommitmentPreimage) -> Result<Erc20Note, NoteError> {
    let amount: u128 = preimage.amount.saturating_to();
    if U256::from(amount) != preimage.amount || amount >= MAX_NOTE_AMOUNT {
        return Err(NoteError::MalformedNote);
    }

    let x = u256_to_fr(&preimage.pubkey[0]);
    let y = u256_to_fr(&preimage.pubkey[1]);
    let random_word = preimage.random.to_be_bytes::<32>();

    Ok(Erc20Note::new(
        NotePublicKey::from_unpacked(&x, &y),
        random_word[16..].try_into().unwrap(),
        amount,
        TokenField::new(preimage.token.to_be_bytes::<32>()),
    ))
}

fn encrypted_note(commitment: &EncryptedCommitment) -> EncryptedNote {
    let iv_word = commitment.ciphertext[0].to_be_bytes::<32>();
    let data = commitment.ciphertext[1..]
        .iter()
        .map(|word| word.to_be_bytes::<32>().to_vec())
        .collect();

    let x = u256_to_fr(&commitment.senderPubKey[0]);
    let y = u256_to_fr(&commitment.senderPubKey[1]);

    EncryptedNote {
        hash: u256_to_fr(&commitment.hash),
        ciphertext: CiphertextCtr {
            iv: iv_word[16..].try_into().unwrap(),
            data,
        },
        sender_pubkey: NotePublicKey::from_unpacked(&x, &y),
    }
}

/// Serializes `generateDeposit` calldata for a batch of notes.
pub fn generate_deposit_calldata(notes: &[Erc20Note]) -> Result<Vec<u8>, NoteError> {
    let mut commitments = Vec::with_capacity(notes.len());
    for note in notes {
        let (x, y) = note.pubkey.unpack()?;
        commitments.push(CommitmentPreimage {
            pubkey: [
                U256::from_be_bytes::<32>(crate::crypto::keys::fr_to_bytes(&x)),
                U256::from_be_bytes::<32>(crate::crypto::keys::fr_to_bytes(&y)),
            ],
            random: U256::from_be_bytes::<32>(note.random_word()),
            amount: U256::from(note.amount),
            tokenType: crate::note::TokenType::Erc20 as u8,
            tokenSubID: U256::ZERO,
            token: note.token.to_u256(),
        });
    }

    Ok(RailgunLogic::generateDepositCall {
        _commitments: commitments,
    }
    .abi_encode())
}

/// Serializes `transact` calldata for a batch of proved spends.
pub fn transact_calldata(transactions: Vec<Transaction>) -> Vec<u8> {
    RailgunLogic::transactCall {
        _transactions: transactions,
    }
    .abi_encode()
}

/// Historical event replay over chain RPC.
pub struct EventReplay {
    provider: DynProvider,
    chain: ChainConfig,
    chunk_size: u64,
    max_retries: u32,
}

impl EventReplay {
    pub fn new(provider: DynProvider, chain: ChainConfig) -> Self {
        EventReplay {
            provider,
            chain,
            chunk_size: SCAN_CHUNK_SIZE,
            max_retries: MAX_CHUNK_RETRIES,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Replays events from the last persisted block to the chain tip,
    /// advancing the persisted cursor after each chunk.
    ///
    /// The cancellation flag is observed between chunks: a cancelled replay
    /// stops after the chunk in flight and leaves the cursor consistent.
    #[tracing::instrument(name = "event_replay", skip_all, fields(chain = self.chain.id))]
    pub async fn replay<F>(
        &self,
        db: &dyn Database,
        cancel: &AtomicBool,
        mut on_event: F,
    ) -> Result<u64, ContractError>
    where
        F: FnMut(ChainEvent),
    {
        let cursor_key = sync_cursor_key(self.chain.id);
        let mut from_block = match db.get(&cursor_key).await? {
            Some(bytes) => crate::db::decode_value::<u64>(&bytes)? + 1,
            None => self.chain.deployment_block,
        };

        let latest = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ContractError::RpcRetryExhausted {
                from: from_block,
                to: from_block,
                source: e.into(),
            })?;

        while from_block <= latest {
            if cancel.load(Ordering::Relaxed) {
                info!("Replay cancelled at block {from_block}");
                break;
            }

            let to_block = (from_block + self.chunk_size - 1).min(latest);
            let logs = self.fetch_chunk(from_block, to_block).await?;

            for log in logs {
                match decode_event(&log) {
                    Ok(Some(event)) => on_event(event),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }

            db.put(&cursor_key, crate::db::encode_value(&to_block)?)
                .await?;
            from_block = to_block + 1;
        }

        Ok(from_block.saturating_sub(1))
    }

    /// Replays directly into a shared commitment mirror.
    ///
    /// The mirror's write lock is held for the duration of the replay, so
    /// events land in `(tree, position)` order before any reader observes
    /// a later nullifier.
    pub async fn replay_into(
        &self,
        db: &dyn Database,
        cancel: &AtomicBool,
        mirror: &tokio::sync::RwLock<crate::mirror::CommitmentMirror>,
    ) -> Result<u64, ContractError> {
        let mut mirror = mirror.write().await;
        self.replay(db, cancel, |event| match event {
            ChainEvent::Commitment(commitment) => mirror.apply(&commitment),
            ChainEvent::Nullifier { nullifier, txid } => mirror.mark_nullified(nullifier, txid),
        })
        .await
    }

    async fn fetch_chunk(&self, from: u64, to: u64) -> Result<Vec<Log>, ContractError> {
        // The provider only permits three event filters per query; these
        // three are the protocol's entire event surface.
        let filter = Filter::new()
            .address(self.chain.proxy_contract)
            .event_signature(vec![
                RailgunLogic::GeneratedCommitmentBatch::SIGNATURE_HASH,
                RailgunLogic::CommitmentBatch::SIGNATURE_HASH,
                RailgunLogic::Nullifier::SIGNATURE_HASH,
            ])
            .from_block(from)
            .to_block(to);

        let mut delay = RETRY_BASE_DELAY;
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            match self.provider.get_logs(&filter).await {
                Ok(logs) => {
                    info!("Fetched {} logs from blocks {from} to {to}", logs.len());
                    return Ok(logs);
                }
                Err(e) => {
                    warn!(
                        "Log fetch for blocks {from}..={to} failed (attempt {}): {e}",
                        attempt + 1
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
            }
        }

        Err(ContractError::RpcRetryExhausted {
            from,
            to,
            //? Safe to unwrap: the loop ran at least once to get here
            source: last_error.unwrap().into(),
        })
    }
}

pub fn sync_cursor_key(chain_id: u64) -> String {
    crate::db::join_key(&["sync", &crate::db::key_segment(chain_id)])
}

fn decode_event(log: &Log) -> Result<Option<ChainEvent>, ContractError> {
    let Some(topic0) = log.topics().first() else {
        return Ok(None);
    };
    let txid = log.transaction_hash.unwrap_or_default();

    match *topic0 {
        RailgunLogic::GeneratedCommitmentBatch::SIGNATURE_HASH => {
            let event = RailgunLogic::GeneratedCommitmentBatch::decode_log(&log.inner)?;

            let mut notes = Vec::with_capacity(event.data.commitments.len());
            for preimage in &event.data.commitments {
                match note_from_preimage(preimage) {
                    Ok(note) => notes.push(Some(note)),
                    Err(e) => {
                        // A malformed preimage costs one leaf, not the scan.
                        warn!("Skipping malformed deposit preimage in {txid}: {e}");
                        notes.push(None);
                    }
                }
            }

            Ok(Some(ChainEvent::Commitment(CommitmentEvent::Generated {
                tree: event.data.treeNumber.saturating_to(),
                start_position: event.data.startPosition.saturating_to(),
                notes,
                txid,
            })))
        }
        RailgunLogic::CommitmentBatch::SIGNATURE_HASH => {
            let event = RailgunLogic::CommitmentBatch::decode_log(&log.inner)?;
            let commitments = event.data.commitments.iter().map(encrypted_note).collect();

            Ok(Some(ChainEvent::Commitment(CommitmentEvent::Encrypted {
                tree: event.data.treeNumber.saturating_to(),
                start_position: event.data.startPosition.saturating_to(),
                commitments,
                txid,
            })))
        }
        RailgunLogic::Nullifier::SIGNATURE_HASH => {
            let event = RailgunLogic::Nullifier::decode_log(&log.inner)?;
            Ok(Some(ChainEvent::Nullifier {
                nullifier: u256_to_fr(&event.data.nullifier),
                txid,
            }))
        }
        _ => Ok(None),
    }
}
