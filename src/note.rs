use alloy::primitives::{Address, U256};
use ark_bn254::Fr;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use rand::random;

use crate::crypto::{
    aes::{CiphertextCtr, decrypt_ctr, encrypt_ctr},
    babyjubjub::BabyJubjubError,
    concat_arrays,
    keys::{ByteKey, FieldKey, NotePublicKey, SharedSecret, SpendingKey, bytes_to_fr, fr_to_bytes},
    poseidon::poseidon_hash,
};

/// Note amounts are carried on-chain as uint120.
pub const MAX_NOTE_AMOUNT: u128 = 1 << 120;

/// Token classes of the on-chain data model. Only fungible spends are
/// implemented; the other classes are reserved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenType {
    Erc20 = 0,
    Erc721 = 1,
    Erc1155 = 2,
}

/// A fungible-token contract address, zero-padded to a 32-byte word.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TokenField([u8; 32]);

impl TokenField {
    pub fn new(bytes: [u8; 32]) -> Self {
        TokenField(bytes)
    }

    pub fn from_address(address: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(address.as_slice());
        TokenField(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_fr(&self) -> Fr {
        bytes_to_fr(&self.0)
    }

    pub fn to_u256(&self) -> U256 {
        U256::from_be_bytes::<32>(self.0)
    }
}

/// An ERC-20 note: the owner's packed public key, a per-note nonce, the
/// amount, and the token it denominates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Erc20Note {
    pub pubkey: NotePublicKey,
    pub random: [u8; 16],
    pub amount: u128,
    pub token: TokenField,
}

/// Canonical db form of a note. The public key is omitted for records whose
/// key is derivable from the wallet's own hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedNote {
    pub pubkey: Option<NotePublicKey>,
    pub random: [u8; 16],
    pub amount: u128,
    pub token: TokenField,
}

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("Malformed note ciphertext")]
    MalformedNote,
    #[error(transparent)]
    Point(#[from] BabyJubjubError),
}

impl Erc20Note {
    pub fn new(pubkey: NotePublicKey, random: [u8; 16], amount: u128, token: TokenField) -> Self {
        Erc20Note {
            pubkey,
            random,
            amount,
            token,
        }
    }

    /// A note to `pubkey` with a fresh nonce.
    pub fn new_random(pubkey: NotePublicKey, amount: u128, token: TokenField) -> Self {
        Erc20Note::new(pubkey, random(), amount, token)
    }

    /// A zero-value note to a throwaway key, used to pad spends and outputs
    /// up to the fixed circuit arity.
    pub fn dummy(token: TokenField) -> (Self, SpendingKey) {
        let key = SpendingKey::random();
        let note = Erc20Note::new_random(key.public_key(), 0, token);
        (note, key)
    }

    /// The note's tree leaf: `poseidon(x, y, amount, random, token)` over
    /// the unpacked owner key.
    pub fn commitment(&self) -> Result<Fr, NoteError> {
        let (x, y) = self.pubkey.unpack()?;
        Ok(poseidon_hash(&[
            x,
            y,
            Fr::from(self.amount),
            self.random_fr(),
            self.token.to_fr(),
        ]))
    }

    /// The spend tag for this note at a specific leaf:
    /// `poseidon(sk, tree, position)`.
    pub fn nullifier(spending_key: &SpendingKey, tree: u32, position: u32) -> Fr {
        poseidon_hash(&[
            spending_key.to_fr(),
            Fr::from(tree as u64),
            Fr::from(position as u64),
        ])
    }

    /// Encrypts into three 32-byte blocks: owner key, nonce-and-amount,
    /// token. The layout is fixed by the decrypt side of the protocol.
    pub fn encrypt(&self, shared: &SharedSecret) -> CiphertextCtr {
        let middle: [u8; 32] = concat_arrays(&self.random, &self.amount.to_be_bytes());
        encrypt_ctr(
            &[self.pubkey.as_bytes(), &middle, self.token.as_bytes()],
            shared.as_bytes(),
        )
    }

    pub fn decrypt(
        ciphertext: &CiphertextCtr,
        shared: &SharedSecret,
    ) -> Result<Erc20Note, NoteError> {
        let blocks = decrypt_ctr(ciphertext, shared.as_bytes());
        if blocks.len() != 3 || blocks.iter().any(|b| b.len() != 32) {
            return Err(NoteError::MalformedNote);
        }

        let pubkey = NotePublicKey::from_bytes(blocks[0].as_slice().try_into().unwrap());
        let random: [u8; 16] = blocks[1][..16].try_into().unwrap();
        let amount = u128::from_be_bytes(blocks[1][16..].try_into().unwrap());
        let token = TokenField::new(blocks[2].as_slice().try_into().unwrap());

        if amount >= MAX_NOTE_AMOUNT {
            return Err(NoteError::MalformedNote);
        }

        Ok(Erc20Note {
            pubkey,
            random,
            amount,
            token,
        })
    }

    pub fn serialize(&self, with_pubkey: bool) -> SerializedNote {
        SerializedNote {
            pubkey: with_pubkey.then_some(self.pubkey),
            random: self.random,
            amount: self.amount,
            token: self.token,
        }
    }

    pub fn deserialize(
        serialized: SerializedNote,
        pubkey: Option<NotePublicKey>,
    ) -> Result<Erc20Note, NoteError> {
        let pubkey = serialized
            .pubkey
            .or(pubkey)
            .ok_or(NoteError::MalformedNote)?;

        if serialized.amount >= MAX_NOTE_AMOUNT {
            return Err(NoteError::MalformedNote);
        }

        Ok(Erc20Note {
            pubkey,
            random: serialized.random,
            amount: serialized.amount,
            token: serialized.token,
        })
    }

    /// The nonce as a field element, left-padded to the full word.
    pub fn random_fr(&self) -> Fr {
        let padded: [u8; 32] = concat_arrays(&[0u8; 16], &self.random);
        bytes_to_fr(&padded)
    }

    /// The nonce as a left-padded 32-byte word, the width it is carried at
    /// across every uint256 boundary.
    pub fn random_word(&self) -> [u8; 32] {
        fr_to_bytes(&self.random_fr())
    }
}
