use alloy::primitives::U256;
use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use num_bigint::{BigInt, Sign};

use crate::crypto::{
    babyjubjub::{self, BabyJubjubError},
    sha256,
};

/// Private key for spending notes: a Baby-Jubjub scalar held as a
/// big-endian field element.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SpendingKey([u8; 32]);

/// Packed Baby-Jubjub public key identifying a note's owner.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct NotePublicKey([u8; 32]);

/// Symmetric key agreed via ECDH, used for note ciphertexts.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SharedSecret([u8; 32]);

/// Symmetric key derived from the wallet's first spending key, used to wrap
/// outgoing shared secrets so the sender can audit its own outputs later.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ViewKey([u8; 32]);

pub trait ByteKey: Sized {
    fn from_bytes(bytes: [u8; 32]) -> Self;
    fn as_bytes(&self) -> &[u8; 32];
}

pub trait FieldKey: ByteKey {
    fn from_fr(fr: &Fr) -> Self {
        Self::from_bytes(fr_to_bytes(fr))
    }

    fn to_fr(&self) -> Fr {
        Fr::from_be_bytes_mod_order(self.as_bytes())
    }
}

pub trait HexKey: ByteKey {
    fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self::from_bytes(arr))
    }
}

pub trait U256Key: ByteKey {
    fn from_u256(value: U256) -> Self {
        Self::from_bytes(value.to_be_bytes::<32>())
    }

    fn to_u256(&self) -> U256 {
        U256::from_be_bytes::<32>(*self.as_bytes())
    }
}

macro_rules! impl_byte_key {
    ($name:ident) => {
        impl ByteKey for $name {
            fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
            fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }
        impl FieldKey for $name {}
        impl HexKey for $name {}
        impl U256Key for $name {}
    };
}

impl_byte_key!(SpendingKey);
impl_byte_key!(NotePublicKey);
impl_byte_key!(SharedSecret);
impl_byte_key!(ViewKey);

impl SpendingKey {
    /// Derives a spending key from seed material: `sha256(seed) mod p`.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(fr_to_bytes(&Fr::from_be_bytes_mod_order(&sha256(seed))))
    }

    /// Fresh throwaway key, used for dummy notes and per-output senders.
    pub fn random() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    pub fn public_key(&self) -> NotePublicKey {
        NotePublicKey(babyjubjub::private_to_public(&self.0))
    }

    /// ECDH against another party's packed public key.
    pub fn shared_secret(&self, their: &NotePublicKey) -> Result<SharedSecret, BabyJubjubError> {
        Ok(SharedSecret(babyjubjub::ecdh(&self.0, &their.0)?))
    }

    pub fn view_key(&self) -> ViewKey {
        ViewKey(sha256(&self.0))
    }

    pub fn to_bigint(&self) -> BigInt {
        BigInt::from_bytes_be(Sign::Plus, &self.0)
    }
}

impl NotePublicKey {
    /// Affine `(x, y)` coordinates. Fails with `InvalidPoint` when the
    /// encoded y is not on the curve.
    pub fn unpack(&self) -> Result<(Fr, Fr), BabyJubjubError> {
        babyjubjub::unpack_point(&self.0)
    }

    pub fn from_unpacked(x: &Fr, y: &Fr) -> Self {
        NotePublicKey(babyjubjub::pack_point(x, y))
    }
}

pub fn fr_to_bytes(value: &Fr) -> [u8; 32] {
    value.into_bigint().to_bytes_be().try_into().unwrap()
}

pub fn bytes_to_fr(bytes: &[u8; 32]) -> Fr {
    Fr::from_be_bytes_mod_order(bytes)
}

pub fn fr_to_bigint(fr: &Fr) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, &fr_to_bytes(fr))
}

pub fn bigint_to_fr(bi: &BigInt) -> Fr {
    let (_sign, bytes) = bi.to_bytes_be();
    Fr::from_be_bytes_mod_order(&bytes)
}

pub fn fr_to_u256(fr: &Fr) -> U256 {
    U256::from_be_bytes::<32>(fr_to_bytes(fr))
}

pub fn u256_to_fr(value: &U256) -> Fr {
    Fr::from_be_bytes_mod_order(&value.to_be_bytes::<32>())
}

pub fn hex_to_fr(hex_str: &str) -> Fr {
    let stripped = hex_str.trim_start_matches("0x");
    let bytes = hex::decode(stripped).unwrap();
    Fr::from_be_bytes_mod_order(&bytes)
}
