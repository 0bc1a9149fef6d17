//! BIP-39 / BIP-32-style hierarchical key derivation onto Baby-Jubjub.
//!
//! A mnemonic expands to a 64-byte seed; hardened HMAC-SHA512 derivation
//! walks the configured root path. Off the root, `/0'` is the primary
//! receiving tree and `/1'` the change tree, with one keypair per hardened
//! index below each.

use alloy::primitives::ChainId;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;

use crate::{
    address::ShieldedAddress,
    crypto::keys::{NotePublicKey, SpendingKey},
};

type HmacSha512 = Hmac<Sha512>;

pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/1984'/0'/0'";

const MASTER_HMAC_KEY: &[u8] = b"babyjubjub seed";
const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Sub-path for primary (receiving) keypairs off the wallet root.
pub const PRIMARY_SUBTREE: u32 = 0;
/// Sub-path for change keypairs off the wallet root.
pub const CHANGE_SUBTREE: u32 = 1;

#[derive(Debug, Error)]
pub enum KeyDerivationError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] bip39::Error),
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),
}

/// One node of the hardened derivation hierarchy.
#[derive(Clone)]
pub struct KeyNode {
    chain_key: [u8; 32],
    chain_code: [u8; 32],
}

/// Spending keypair derived at a leaf node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AccountKeypair {
    pub spending_key: SpendingKey,
    pub pubkey: NotePublicKey,
}

impl KeyNode {
    pub fn from_mnemonic(phrase: &str) -> Result<Self, KeyDerivationError> {
        let mnemonic = bip39::Mnemonic::parse(phrase)?;
        Ok(Self::from_seed(&mnemonic.to_seed("")))
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = hmac_sha512(MASTER_HMAC_KEY, seed);
        Self::from_digest(&digest)
    }

    pub fn derive_path(&self, path: &str) -> Result<KeyNode, KeyDerivationError> {
        let mut node = self.clone();
        for index in parse_path(path)? {
            node = node.derive_hardened(index);
        }
        Ok(node)
    }

    pub fn derive_hardened(&self, index: u32) -> KeyNode {
        let mut data = Vec::with_capacity(1 + 32 + 4);
        data.push(0x00);
        data.extend_from_slice(&self.chain_key);
        data.extend_from_slice(&(index | HARDENED_OFFSET).to_be_bytes());

        let digest = hmac_sha512(&self.chain_code, &data);
        Self::from_digest(&digest)
    }

    /// The Baby-Jubjub keypair at this node.
    pub fn keypair(&self) -> AccountKeypair {
        let spending_key = SpendingKey::from_seed(&self.chain_key);
        AccountKeypair {
            spending_key,
            pubkey: spending_key.public_key(),
        }
    }

    fn from_digest(digest: &[u8; 64]) -> Self {
        KeyNode {
            chain_key: digest[..32].try_into().unwrap(),
            chain_code: digest[32..].try_into().unwrap(),
        }
    }
}

impl AccountKeypair {
    pub fn address(&self, chain_id: Option<ChainId>) -> ShieldedAddress {
        ShieldedAddress::new(self.pubkey, chain_id)
    }
}

/// Parses a hardened path of the form `m/44'/1984'/0'/0'`.
///
/// Every component must be hardened: the hierarchy has no public-derivation
/// half, so an unhardened component is always a caller mistake.
fn parse_path(path: &str) -> Result<Vec<u32>, KeyDerivationError> {
    let rest = path
        .strip_prefix("m/")
        .ok_or_else(|| KeyDerivationError::InvalidPath(path.to_string()))?;

    let mut components = Vec::new();
    for part in rest.split('/') {
        let index = part
            .strip_suffix('\'')
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n < HARDENED_OFFSET)
            .ok_or_else(|| KeyDerivationError::InvalidPath(path.to_string()))?;
        components.push(index);
    }

    Ok(components)
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    //? Safe to unwrap: HMAC accepts any key length
    let mut mac = HmacSha512::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}
