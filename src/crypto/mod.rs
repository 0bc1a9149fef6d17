use ark_bn254::Fr;
use ark_ff::PrimeField;
use sha2::{Digest, Sha256};

pub mod aes;
pub mod babyjubjub;
pub mod keys;
pub mod poseidon;

pub const SNARK_SCALAR_FIELD: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hashes arbitrary bytes and reduces the digest into the SNARK scalar field.
///
/// Off-circuit digests are always reduced before being used as field
/// elements.
pub fn hash_to_scalar(data: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(&sha256(data))
}

pub fn concat_arrays<const A: usize, const B: usize, const C: usize>(
    a: &[u8; A],
    b: &[u8; B],
) -> [u8; C] {
    assert_eq!(A + B, C);
    let mut out = [0u8; C];
    out[..A].copy_from_slice(a);
    out[A..].copy_from_slice(b);
    out
}

/// Left-pads (or left-truncates) a byte slice to a 32-byte word.
pub fn pad_to_32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let src_start = bytes.len().saturating_sub(32);
    let dst_start = 32usize.saturating_sub(bytes.len());
    out[dst_start..].copy_from_slice(&bytes[src_start..]);
    out
}
