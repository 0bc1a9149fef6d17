//! Bech32 address codec.
//!
//! Payload is `VERSION (1 byte) || packed public key`, under a
//! human-readable prefix identifying the network the address was issued
//! for. Addresses without a recognized network encode under `rgany`.

use std::{fmt::Display, str::FromStr};

use alloy::primitives::ChainId;
use bech32::Hrp;
use thiserror::Error;

use crate::crypto::keys::{ByteKey, NotePublicKey};

pub const ADDRESS_VERSION: u8 = 1;

const ANY_PREFIX: Hrp = Hrp::parse_unchecked("rgany");

const PREFIXES: [(ChainId, Hrp); 5] = [
    (1, Hrp::parse_unchecked("rgeth")),
    (3, Hrp::parse_unchecked("rgtestropsten")),
    (5, Hrp::parse_unchecked("rgtestgoerli")),
    (56, Hrp::parse_unchecked("rgbsc")),
    (137, Hrp::parse_unchecked("rgpoly")),
];

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Bech32 decoding error: {0}")]
    Bech32Decode(#[from] bech32::DecodeError),
    #[error("Unknown address prefix: {0}")]
    UnknownPrefix(String),
    #[error("Wrong address version: {0}")]
    WrongVersion(u8),
    #[error("Address payload is empty")]
    EmptyPayload,
    #[error("Unexpected public key length: {0}")]
    InvalidKeyLength(usize),
}

/// A decoded address payload. The key is kept as raw bytes so the codec
/// stays agnostic of the key width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAddress {
    pub pubkey: Vec<u8>,
    pub chain_id: Option<ChainId>,
}

pub fn encode(pubkey: &[u8], chain_id: Option<ChainId>) -> String {
    let hrp = chain_id
        .and_then(|id| {
            PREFIXES
                .iter()
                .find(|(chain, _)| *chain == id)
                .map(|(_, hrp)| *hrp)
        })
        .unwrap_or(ANY_PREFIX);

    let mut payload = Vec::with_capacity(1 + pubkey.len());
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey);

    //? Safe to unwrap: payload is always far below the bech32 length limit
    bech32::encode::<bech32::Bech32>(hrp, &payload).unwrap()
}

pub fn decode(address: &str) -> Result<DecodedAddress, AddressError> {
    let (hrp, payload) = bech32::decode(address)?;

    let chain_id = if hrp == ANY_PREFIX {
        None
    } else {
        let known = PREFIXES.iter().find(|(_, prefix)| *prefix == hrp);
        match known {
            Some((chain, _)) => Some(*chain),
            None => return Err(AddressError::UnknownPrefix(hrp.to_string())),
        }
    };

    let version = *payload.first().ok_or(AddressError::EmptyPayload)?;
    if version != ADDRESS_VERSION {
        return Err(AddressError::WrongVersion(version));
    }

    Ok(DecodedAddress {
        pubkey: payload[1..].to_vec(),
        chain_id,
    })
}

/// A wallet-issued shielded address: a packed public key plus the network
/// it was issued for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShieldedAddress {
    pubkey: NotePublicKey,
    chain_id: Option<ChainId>,
}

impl ShieldedAddress {
    pub fn new(pubkey: NotePublicKey, chain_id: Option<ChainId>) -> Self {
        ShieldedAddress { pubkey, chain_id }
    }

    pub fn pubkey(&self) -> NotePublicKey {
        self.pubkey
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.chain_id
    }
}

impl Display for ShieldedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", encode(self.pubkey.as_bytes(), self.chain_id))
    }
}

impl FromStr for ShieldedAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = decode(s)?;
        let bytes: [u8; 32] = decoded
            .pubkey
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::InvalidKeyLength(decoded.pubkey.len()))?;

        Ok(ShieldedAddress {
            pubkey: NotePublicKey::from_bytes(bytes),
            chain_id: decoded.chain_id,
        })
    }
}
