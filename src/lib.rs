//! Privacy-preserving wallet core for a shielded-transfer pool on
//! EVM-style chains.
//!
//! Notes live as Poseidon commitments in on-chain Merkle trees; spends
//! reveal only nullifiers and Groth16 proofs. This crate mirrors the
//! on-chain commitment state, scans it for notes addressed to derived
//! keys, and assembles proved spend transactions.

pub mod address;
pub mod chain_config;
pub mod circuit;
pub mod contract;
pub mod crypto;
pub mod db;
pub mod key_derivation;
pub mod merkle_tree;
pub mod mirror;
pub mod note;
pub mod transaction;
pub mod wallet;

pub use crate::crypto::keys::hex_to_fr;
