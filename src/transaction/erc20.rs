//! ERC-20 spend builder: UTXO selection, circuit-arity padding, output
//! ciphertexts, and witness assembly.

use std::collections::BTreeMap;

use alloy::primitives::{Address, ChainId, U256, aliases::U120};
use ark_bn254::Fr;
use ark_ff::PrimeField;
use thiserror::Error;
use tracing::info;

use crate::{
    circuit::{
        CIRCUIT_OUTPUTS, Circuit, LARGE_CIRCUIT_INPUTS, SMALL_CIRCUIT_INPUTS,
        inputs::{AdaptId, Erc20PrivateInputs, InputsError, PublicInputs},
        prover::{Proof, Prover, ProverError},
    },
    contract::{self, CommitmentOut, G1Point, G2Point, SnarkProof},
    crypto::{
        aes::{CiphertextCtr, encrypt_ctr},
        hash_to_scalar,
        keys::{ByteKey, NotePublicKey, SpendingKey, ViewKey, fr_to_bytes, fr_to_u256},
        pad_to_32,
    },
    merkle_tree::{MerkleTreeError, TREE_DEPTH},
    mirror::CommitmentMirror,
    note::{Erc20Note, NoteError, TokenField, TokenType},
    transaction::SpendableNote,
};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("At most two recipient outputs per transaction, got {0}")]
    TooManyOutputs(usize),
    #[error("Output token does not match the transaction token")]
    TokenMismatch,
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u128, available: u128 },
    #[error("No single tree can cover the spend within the large circuit; consolidate first")]
    NeedsConsolidation,
    #[error("Withdraw amount and withdraw address must be set together")]
    WithdrawConfig,
    #[error("Tree root is outside the contract's retained history")]
    RootNotKnown,
    #[error(transparent)]
    Note(#[from] NoteError),
    #[error(transparent)]
    Inputs(#[from] InputsError),
    #[error(transparent)]
    Prover(#[from] ProverError),
    #[error(transparent)]
    Tree(#[from] MerkleTreeError),
}

/// A spend under assembly.
#[derive(Debug, Clone)]
pub struct Erc20Transaction {
    chain_id: ChainId,
    token: TokenField,
    deposit: u128,
    withdraw: u128,
    withdraw_address: Option<Address>,
    outputs: Vec<Erc20Note>,
    adapt_id: AdaptId,
    tree: Option<u32>,
}

/// One recipient's encrypted payload, exactly as it is hashed into the
/// public inputs and carried in calldata.
#[derive(Debug, Clone)]
pub struct NoteCiphertext {
    pub sender_pubkey: (Fr, Fr),
    /// `iv` plus the three note blocks.
    pub ciphertext: CiphertextCtr,
    /// The per-recipient shared secret wrapped under the sender's view key,
    /// so the sender can reconstruct its outputs for audit.
    pub reveal_key: CiphertextCtr,
}

/// A fully assembled spend, ready for the prover.
#[derive(Debug, Clone)]
pub struct UnprovenTransaction {
    pub circuit: Circuit,
    pub private: Erc20PrivateInputs,
    pub public: PublicInputs,
    pub ciphertexts: Vec<NoteCiphertext>,
    /// Leaf coordinates of the real notes this spend consumes.
    pub spent: Vec<(u32, u32)>,
}

struct SelectedInput {
    note: Erc20Note,
    spending_key: SpendingKey,
    position: u32,
    real: bool,
}

impl Erc20Transaction {
    pub fn new(chain_id: ChainId, token: TokenField) -> Self {
        Erc20Transaction {
            chain_id,
            token,
            deposit: 0,
            withdraw: 0,
            withdraw_address: None,
            outputs: Vec::new(),
            adapt_id: AdaptId::default(),
            tree: None,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Adds a recipient note. At most two real outputs fit one spend.
    pub fn output(mut self, note: Erc20Note) -> Self {
        self.outputs.push(note);
        self
    }

    /// Plaintext value arriving from the public side of the transaction.
    pub fn deposit(mut self, amount: u128) -> Self {
        self.deposit = amount;
        self
    }

    pub fn withdraw_amount(mut self, amount: u128) -> Self {
        self.withdraw = amount;
        self
    }

    pub fn withdraw_to(mut self, address: Address) -> Self {
        self.withdraw_address = Some(address);
        self
    }

    pub fn adapt_id(mut self, adapt_id: AdaptId) -> Self {
        self.adapt_id = adapt_id;
        self
    }

    /// Pins UTXO selection to one tree instead of taking the first usable.
    pub fn pin_tree(mut self, tree: u32) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Selects UTXOs, pads both sides to circuit arity, encrypts outputs,
    /// and assembles the witness. Everything but the proof itself.
    pub fn generate_transaction(
        &self,
        utxos: &[SpendableNote],
        mirror: &mut CommitmentMirror,
        change_pubkey: NotePublicKey,
        view_key: &ViewKey,
    ) -> Result<UnprovenTransaction, TransactionError> {
        if self.outputs.len() > 2 {
            return Err(TransactionError::TooManyOutputs(self.outputs.len()));
        }
        if self.outputs.iter().any(|note| note.token != self.token) {
            return Err(TransactionError::TokenMismatch);
        }

        let outputs_sum: u128 = self.outputs.iter().map(|note| note.amount).sum();
        let total_out = outputs_sum + self.withdraw;
        let required = total_out.saturating_sub(self.deposit);

        let (tree, inputs) = self.select_inputs(utxos, required)?;

        match (self.withdraw > 0, self.withdraw_address.is_some()) {
            (true, false) | (false, true) => return Err(TransactionError::WithdrawConfig),
            _ => {}
        }

        let merkle_root = mirror.root(tree);
        if !mirror.known_root(tree, merkle_root) {
            return Err(TransactionError::RootNotKnown);
        }

        // Per-input witness columns
        let mut random_in = Vec::with_capacity(inputs.len());
        let mut values_in = Vec::with_capacity(inputs.len());
        let mut spending_keys = Vec::with_capacity(inputs.len());
        let mut nullifiers = Vec::with_capacity(inputs.len());
        let mut path_elements = Vec::with_capacity(inputs.len());
        let mut path_indices = Vec::with_capacity(inputs.len());
        let mut spent = Vec::new();

        for input in &inputs {
            random_in.push(input.note.random_fr());
            values_in.push(input.note.amount);
            spending_keys.push(input.spending_key);
            nullifiers.push(Erc20Note::nullifier(
                &input.spending_key,
                tree,
                input.position,
            ));

            if input.real {
                let proof = mirror.proof(tree, input.position as usize)?;
                path_elements.push(proof.elements);
                path_indices.push(input.position);
                spent.push((tree, input.position));
            } else {
                path_elements.push(vec![Fr::from(0u64); TREE_DEPTH]);
                path_indices.push(0);
            }
        }

        // Outputs: recipients, then change, then dummy padding up to three
        let total_in: u128 = self.deposit + values_in.iter().sum::<u128>();
        let change_amount = total_in - total_out;

        let mut outputs = self.outputs.clone();
        outputs.push(Erc20Note::new_random(change_pubkey, change_amount, self.token));
        while outputs.len() < CIRCUIT_OUTPUTS {
            outputs.push(Erc20Note::dummy(self.token).0);
        }

        let mut recipient_pk = Vec::with_capacity(outputs.len());
        let mut commitments_out = Vec::with_capacity(outputs.len());
        let mut ciphertexts = Vec::with_capacity(outputs.len());
        for note in &outputs {
            recipient_pk.push(note.pubkey.unpack().map_err(NoteError::Point)?);
            commitments_out.push(note.commitment()?);
            ciphertexts.push(encrypt_output(note, view_key)?);
        }

        let ciphertext_hash = hash_ciphertexts(&ciphertexts);

        let output_token_field = if self.deposit > 0 || self.withdraw > 0 {
            self.token.to_fr()
        } else {
            Fr::from(0u64)
        };
        let output_eth_address = self
            .withdraw_address
            .map(|address| Fr::from_be_bytes_mod_order(&pad_to_32(address.as_slice())))
            .unwrap_or(Fr::from(0u64));

        let private = Erc20PrivateInputs {
            adapt_id: self.adapt_id,
            token_field: self.token.to_fr(),
            deposit_amount: self.deposit,
            withdraw_amount: self.withdraw,
            output_token_field,
            output_eth_address,
            random_in,
            values_in,
            spending_keys,
            tree_number: tree,
            merkle_root,
            nullifiers,
            path_elements,
            path_indices,
            recipient_pk,
            random_out: outputs.iter().map(|note| note.random_fr()).collect(),
            values_out: outputs.iter().map(|note| note.amount).collect(),
            commitments_out,
            ciphertext_hash,
        };

        let circuit = private.validate()?;
        let public = private.public_inputs();

        info!(
            "Assembled {:?} spend on tree {tree}: {} real inputs, {} outputs",
            circuit,
            spent.len(),
            CIRCUIT_OUTPUTS
        );

        Ok(UnprovenTransaction {
            circuit,
            private,
            public,
            ciphertexts,
            spent,
        })
    }

    /// Greedy selection over per-tree balances, padded up to the next
    /// circuit slot.
    fn select_inputs(
        &self,
        utxos: &[SpendableNote],
        required: u128,
    ) -> Result<(u32, Vec<SelectedInput>), TransactionError> {
        // A spend fully funded by the public deposit needs no real inputs;
        // both circuit slots are filled with dummies.
        if required == 0 {
            let tree = self.tree.unwrap_or(0);
            return Ok((tree, self.dummy_inputs(SMALL_CIRCUIT_INPUTS)));
        }

        let mut by_tree: BTreeMap<u32, Vec<&SpendableNote>> = BTreeMap::new();
        for utxo in utxos {
            if utxo.note.token != self.token {
                continue;
            }
            if let Some(pinned) = self.tree
                && utxo.tree != pinned
            {
                continue;
            }
            by_tree.entry(utxo.tree).or_default().push(utxo);
        }

        let available: u128 = by_tree
            .values()
            .flatten()
            .map(|utxo| utxo.note.amount)
            .sum();
        if available < required {
            return Err(TransactionError::InsufficientBalance {
                required,
                available,
            });
        }

        for (tree, mut notes) in by_tree {
            let tree_balance: u128 = notes.iter().map(|utxo| utxo.note.amount).sum();
            if tree_balance < required {
                continue;
            }

            notes.sort_by(|a, b| b.note.amount.cmp(&a.note.amount));

            let mut selected = Vec::new();
            let mut covered = 0u128;
            for utxo in &notes {
                if covered >= required {
                    break;
                }
                covered += utxo.note.amount;
                selected.push(*utxo);
            }

            if selected.len() > LARGE_CIRCUIT_INPUTS {
                // This tree only covers the value across too many notes.
                continue;
            }

            let slot = if selected.len() <= SMALL_CIRCUIT_INPUTS {
                SMALL_CIRCUIT_INPUTS
            } else {
                LARGE_CIRCUIT_INPUTS
            };

            // Pad with the smallest remaining real notes, then dummies.
            let mut remaining: Vec<&&SpendableNote> = notes[selected.len()..].iter().collect();
            remaining.reverse();
            for utxo in remaining {
                if selected.len() >= slot {
                    break;
                }
                selected.push(*utxo);
            }

            let mut inputs: Vec<SelectedInput> = selected
                .into_iter()
                .map(|utxo| SelectedInput {
                    note: utxo.note.clone(),
                    spending_key: utxo.spending_key,
                    position: utxo.position,
                    real: true,
                })
                .collect();
            inputs.extend(self.dummy_inputs(slot - inputs.len()));

            return Ok((tree, inputs));
        }

        Err(TransactionError::NeedsConsolidation)
    }

    fn dummy_inputs(&self, count: usize) -> Vec<SelectedInput> {
        (0..count)
            .map(|_| {
                let (note, key) = Erc20Note::dummy(self.token);
                SelectedInput {
                    note,
                    spending_key: key,
                    position: 0,
                    real: false,
                }
            })
            .collect()
    }
}

impl UnprovenTransaction {
    pub fn prove(&self, prover: &dyn Prover) -> Result<contract::Transaction, TransactionError> {
        let proof = prover.prove(self.circuit, &self.private)?;
        Ok(self.to_calldata(proof))
    }

    /// Serializes into the on-chain `transact` struct with the given proof.
    pub fn to_calldata(&self, proof: Proof) -> contract::Transaction {
        let public = &self.public;

        let commitments_out = self
            .public
            .commitments_out
            .iter()
            .zip(&self.ciphertexts)
            .map(|(commitment, ciphertext)| CommitmentOut {
                hash: fr_to_u256(commitment),
                ciphertext: ciphertext.ciphertext_words(),
                senderPubKey: [
                    fr_to_u256(&ciphertext.sender_pubkey.0),
                    fr_to_u256(&ciphertext.sender_pubkey.1),
                ],
                revealKey: ciphertext.reveal_words(),
            })
            .collect();

        contract::Transaction {
            proof: SnarkProof {
                a: G1Point {
                    x: proof.a.x,
                    y: proof.a.y,
                },
                b: G2Point {
                    x: proof.b.x,
                    y: proof.b.y,
                },
                c: G1Point {
                    x: proof.c.x,
                    y: proof.c.y,
                },
            },
            adaptIDcontract: public.adapt_id.contract,
            adaptIDparameters: U256::from_be_bytes::<32>(public.adapt_id.parameters),
            depositAmount: U120::saturating_from(public.deposit_amount),
            withdrawAmount: U120::saturating_from(public.withdraw_amount),
            tokenType: TokenType::Erc20 as u8,
            tokenSubID: U256::ZERO,
            tokenField: fr_to_u256(&self.private.token_field),
            outputEthAddress: Address::from_slice(
                &fr_to_bytes(&public.output_eth_address)[12..],
            ),
            treeNumber: U256::from(public.tree_number),
            merkleRoot: fr_to_u256(&public.merkle_root),
            nullifiers: public.nullifiers.iter().map(fr_to_u256).collect(),
            commitmentsOut: commitments_out,
        }
    }
}

impl NoteCiphertext {
    /// `[iv32 || data...]` as uint256 words.
    pub fn ciphertext_words(&self) -> Vec<U256> {
        let mut words = vec![U256::from_be_bytes::<32>(pad_to_32(&self.ciphertext.iv))];
        words.extend(
            self.ciphertext
                .data
                .iter()
                .map(|block| U256::from_be_bytes::<32>(pad_to_32(block))),
        );
        words
    }

    /// `[iv, data]` as uint256 words.
    pub fn reveal_words(&self) -> Vec<U256> {
        let mut words = vec![U256::from_be_bytes::<32>(pad_to_32(&self.reveal_key.iv))];
        words.extend(
            self.reveal_key
                .data
                .iter()
                .map(|block| U256::from_be_bytes::<32>(pad_to_32(block))),
        );
        words
    }
}

/// Encrypts one output under a fresh sender key and wraps the shared secret
/// under the wallet's view key.
fn encrypt_output(note: &Erc20Note, view_key: &ViewKey) -> Result<NoteCiphertext, NoteError> {
    let sender_key = SpendingKey::random();
    let shared = sender_key
        .shared_secret(&note.pubkey)
        .map_err(NoteError::Point)?;

    let ciphertext = note.encrypt(&shared);
    let reveal_key = encrypt_ctr(&[shared.as_bytes()], view_key.as_bytes());

    //? Safe to unwrap: the sender key is a fresh valid scalar
    let sender_pubkey = sender_key.public_key().unpack().unwrap();

    Ok(NoteCiphertext {
        sender_pubkey,
        ciphertext,
        reveal_key,
    })
}

/// `sha256` over every output's bound words, reduced mod p. The exact word
/// sequence is part of the public-input derivation on both sides.
fn hash_ciphertexts(ciphertexts: &[NoteCiphertext]) -> Fr {
    let mut data = Vec::new();
    for ciphertext in ciphertexts {
        data.extend_from_slice(&fr_to_bytes(&ciphertext.sender_pubkey.0));
        data.extend_from_slice(&fr_to_bytes(&ciphertext.sender_pubkey.1));
        for word in ciphertext.ciphertext_words() {
            data.extend_from_slice(&word.to_be_bytes::<32>());
        }
        for word in ciphertext.reveal_words() {
            data.extend_from_slice(&word.to_be_bytes::<32>());
        }
    }
    hash_to_scalar(&data)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;
    use tracing_test::traced_test;

    use crate::crypto::{aes::decrypt_ctr, keys::SharedSecret};

    use super::*;

    fn test_token() -> TokenField {
        TokenField::from_address(address!("0x1234567890123456789012345678901234567890"))
    }

    fn seeded_wallet(amounts: &[u128]) -> (Vec<SpendableNote>, CommitmentMirror) {
        let mut mirror = CommitmentMirror::new(1);
        let mut utxos = Vec::new();
        let mut leaves = Vec::new();

        for (i, &amount) in amounts.iter().enumerate() {
            let key = SpendingKey::from_seed(&[i as u8 + 1; 8]);
            let note = Erc20Note::new(key.public_key(), [i as u8; 16], amount, test_token());
            leaves.push(note.commitment().unwrap());
            utxos.push(SpendableNote {
                tree: 0,
                position: i as u32,
                spending_key: key,
                note,
            });
        }

        mirror.append(0, 0, &leaves);
        (utxos, mirror)
    }

    fn recipient_note(amount: u128) -> Erc20Note {
        let key = SpendingKey::from_seed(b"recipient");
        Erc20Note::new_random(key.public_key(), amount, test_token())
    }

    fn change_pubkey() -> NotePublicKey {
        SpendingKey::from_seed(b"change").public_key()
    }

    fn view_key() -> ViewKey {
        SpendingKey::from_seed(b"viewer").view_key()
    }

    #[test]
    #[traced_test]
    fn test_two_notes_select_small_circuit() {
        let (utxos, mut mirror) = seeded_wallet(&[400, 200]);

        let tx = Erc20Transaction::new(1, test_token())
            .output(recipient_note(300))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        assert_eq!(tx.circuit, Circuit::Erc20Small);
        assert_eq!(tx.public.nullifiers.len(), 2);
        assert_eq!(tx.public.commitments_out.len(), 3);
        // 400 covers the 300; the 200 note pads the second slot.
        assert_eq!(tx.spent.len(), 2);
        // Residue: 400 + 200 - 300
        assert_eq!(tx.private.values_out[1], 300);
    }

    #[test]
    #[traced_test]
    fn test_single_note_pads_with_dummy() {
        let (utxos, mut mirror) = seeded_wallet(&[500]);

        let tx = Erc20Transaction::new(1, test_token())
            .output(recipient_note(300))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        assert_eq!(tx.circuit, Circuit::Erc20Small);
        assert_eq!(tx.spent.len(), 1);
        assert_eq!(tx.private.values_in, vec![500, 0]);

        // Nullifiers are pairwise distinct even with the dummy present.
        assert_ne!(tx.public.nullifiers[0], tx.public.nullifiers[1]);
    }

    #[test]
    #[traced_test]
    fn test_three_notes_route_to_large_circuit() {
        let (utxos, mut mirror) = seeded_wallet(&[100, 100, 100]);

        let tx = Erc20Transaction::new(1, test_token())
            .output(recipient_note(250))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        assert_eq!(tx.circuit, Circuit::Erc20Large);
        assert_eq!(tx.public.nullifiers.len(), 10);
        assert_eq!(tx.spent.len(), 3);
    }

    #[test]
    #[traced_test]
    fn test_consolidation_required_past_large_circuit() {
        // Eleven notes, each below the requirement: no tree fits the spend
        // in ten inputs.
        let amounts = vec![10u128; 11];
        let (utxos, mut mirror) = seeded_wallet(&amounts);

        let result = Erc20Transaction::new(1, test_token())
            .output(recipient_note(105))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key());

        assert!(matches!(result, Err(TransactionError::NeedsConsolidation)));
    }

    #[test]
    #[traced_test]
    fn test_insufficient_balance() {
        let (utxos, mut mirror) = seeded_wallet(&[100]);

        let result = Erc20Transaction::new(1, test_token())
            .output(recipient_note(300))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key());

        assert!(matches!(
            result,
            Err(TransactionError::InsufficientBalance {
                required: 300,
                available: 100
            })
        ));
    }

    #[test]
    #[traced_test]
    fn test_too_many_outputs() {
        let (utxos, mut mirror) = seeded_wallet(&[1000]);

        let result = Erc20Transaction::new(1, test_token())
            .output(recipient_note(1))
            .output(recipient_note(2))
            .output(recipient_note(3))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key());

        assert!(matches!(result, Err(TransactionError::TooManyOutputs(3))));
    }

    #[test]
    #[traced_test]
    fn test_token_mismatch() {
        let (utxos, mut mirror) = seeded_wallet(&[1000]);

        let other_token =
            TokenField::from_address(address!("0x9999999999999999999999999999999999999999"));
        let wrong = Erc20Note::new_random(change_pubkey(), 10, other_token);

        let result = Erc20Transaction::new(1, test_token())
            .output(wrong)
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key());

        assert!(matches!(result, Err(TransactionError::TokenMismatch)));
    }

    #[test]
    #[traced_test]
    fn test_withdraw_without_address_rejected() {
        let (utxos, mut mirror) = seeded_wallet(&[1000]);

        let result = Erc20Transaction::new(1, test_token())
            .withdraw_amount(100)
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key());

        assert!(matches!(result, Err(TransactionError::WithdrawConfig)));
    }

    #[test]
    #[traced_test]
    fn test_address_without_withdraw_rejected() {
        let (utxos, mut mirror) = seeded_wallet(&[1000]);

        let result = Erc20Transaction::new(1, test_token())
            .output(recipient_note(100))
            .withdraw_to(address!("0x1111111111111111111111111111111111111111"))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key());

        assert!(matches!(result, Err(TransactionError::WithdrawConfig)));
    }

    #[test]
    #[traced_test]
    fn test_deposit_only_spend_uses_dummies() {
        let mut mirror = CommitmentMirror::new(1);

        let tx = Erc20Transaction::new(1, test_token())
            .deposit(500)
            .output(recipient_note(500))
            .generate_transaction(&[], &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        assert_eq!(tx.circuit, Circuit::Erc20Small);
        assert!(tx.spent.is_empty());
        assert_eq!(tx.private.values_in, vec![0, 0]);
        // Change nets to zero; output token field reflects the deposit.
        assert_eq!(tx.private.values_out[1], 0);
        assert_eq!(tx.private.output_token_field, test_token().to_fr());
    }

    #[test]
    #[traced_test]
    fn test_ciphertext_hash_binds_outputs() {
        let (utxos, mut mirror) = seeded_wallet(&[400, 200]);
        let builder = Erc20Transaction::new(1, test_token()).output(recipient_note(300));

        let a = builder
            .clone()
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();
        let b = builder
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        // Fresh sender keys and IVs make every assembly's hash unique.
        assert_ne!(a.public.ciphertext_hash, b.public.ciphertext_hash);
        assert_eq!(a.public.ciphertext_hash, a.private.ciphertext_hash);
    }

    #[test]
    #[traced_test]
    fn test_recipient_can_decrypt_output() {
        let (utxos, mut mirror) = seeded_wallet(&[400, 200]);

        let recipient_key = SpendingKey::from_seed(b"recipient");
        let note = Erc20Note::new_random(recipient_key.public_key(), 300, test_token());

        let tx = Erc20Transaction::new(1, test_token())
            .output(note.clone())
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        let ciphertext = &tx.ciphertexts[0];
        let sender_pubkey = NotePublicKey::from_unpacked(
            &ciphertext.sender_pubkey.0,
            &ciphertext.sender_pubkey.1,
        );
        let shared = recipient_key.shared_secret(&sender_pubkey).unwrap();
        let decrypted = Erc20Note::decrypt(&ciphertext.ciphertext, &shared).unwrap();

        assert_eq!(decrypted, note);
    }

    #[test]
    #[traced_test]
    fn test_sender_can_audit_via_view_key() {
        let (utxos, mut mirror) = seeded_wallet(&[400, 200]);
        let note = recipient_note(300);

        let tx = Erc20Transaction::new(1, test_token())
            .output(note.clone())
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        // Unwrap the shared secret with the view key, then decrypt the
        // output with it.
        let ciphertext = &tx.ciphertexts[0];
        let unwrapped = decrypt_ctr(&ciphertext.reveal_key, view_key().as_bytes());
        let shared = SharedSecret::from_bytes(unwrapped[0].as_slice().try_into().unwrap());

        let decrypted = Erc20Note::decrypt(&ciphertext.ciphertext, &shared).unwrap();
        assert_eq!(decrypted, note);
    }

    #[test]
    #[traced_test]
    fn test_calldata_serialization() {
        let (utxos, mut mirror) = seeded_wallet(&[400, 200]);

        let tx = Erc20Transaction::new(1, test_token())
            .output(recipient_note(300))
            .generate_transaction(&utxos, &mut mirror, change_pubkey(), &view_key())
            .unwrap();

        let proof = Proof {
            a: crate::circuit::prover::G1Affine {
                x: U256::from(1u64),
                y: U256::from(2u64),
            },
            b: crate::circuit::prover::G2Affine {
                x: [U256::from(3u64), U256::from(4u64)],
                y: [U256::from(5u64), U256::from(6u64)],
            },
            c: crate::circuit::prover::G1Affine {
                x: U256::from(7u64),
                y: U256::from(8u64),
            },
        };

        let calldata = tx.to_calldata(proof);
        assert_eq!(calldata.nullifiers.len(), 2);
        assert_eq!(calldata.commitmentsOut.len(), 3);
        assert_eq!(calldata.commitmentsOut[0].ciphertext.len(), 4);
        assert_eq!(calldata.commitmentsOut[0].revealKey.len(), 2);
        assert_eq!(calldata.treeNumber, U256::ZERO);

        let encoded = contract::transact_calldata(vec![calldata]);
        assert!(!encoded.is_empty());
    }
}
