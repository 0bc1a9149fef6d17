//! Witness and public-input assembly for the spend circuits.

use alloy::primitives::Address;
use ark_bn254::Fr;
use num_bigint::BigInt;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    circuit::{CIRCUIT_OUTPUTS, Circuit},
    crypto::{
        hash_to_scalar,
        keys::{SpendingKey, fr_to_bigint, fr_to_bytes},
        pad_to_32,
    },
    merkle_tree::{TREE_DEPTH, reconstruct_root},
};

/// Opaque pair bound into the proof so adapter contracts cannot replay it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AdaptId {
    pub contract: Address,
    pub parameters: [u8; 32],
}

impl AdaptId {
    /// `sha256(contract32 || parameters32) mod p`.
    pub fn hash(&self) -> Fr {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&pad_to_32(self.contract.as_slice()));
        data.extend_from_slice(&self.parameters);
        hash_to_scalar(&data)
    }
}

#[derive(Debug, Error)]
pub enum InputsError {
    #[error("Input count {0} does not match a circuit arity")]
    BadInputCount(usize),
    #[error("Expected {CIRCUIT_OUTPUTS} output commitments, got {0}")]
    BadOutputCount(usize),
    #[error("Merkle path for input {0} has wrong depth")]
    BadPathDepth(usize),
    #[error("Merkle path for input {0} does not reconstruct the root")]
    PathMismatch(usize),
}

/// Private witness assignment for one spend.
///
/// Field-typed values are already reduced mod p; byte-typed values are
/// carried as field elements of their left-padded words.
#[derive(Debug, Clone)]
pub struct Erc20PrivateInputs {
    pub adapt_id: AdaptId,
    pub token_field: Fr,
    pub deposit_amount: u128,
    pub withdraw_amount: u128,
    pub output_token_field: Fr,
    pub output_eth_address: Fr,

    pub random_in: Vec<Fr>,
    pub values_in: Vec<u128>,
    pub spending_keys: Vec<SpendingKey>,
    pub tree_number: u32,
    pub merkle_root: Fr,
    pub nullifiers: Vec<Fr>,
    pub path_elements: Vec<Vec<Fr>>,
    pub path_indices: Vec<u32>,

    pub recipient_pk: Vec<(Fr, Fr)>,
    pub random_out: Vec<Fr>,
    pub values_out: Vec<u128>,
    pub commitments_out: Vec<Fr>,
    pub ciphertext_hash: Fr,
}

/// Values the verifier re-derives the single public input from.
#[derive(Debug, Clone)]
pub struct PublicInputs {
    pub adapt_id: AdaptId,
    pub deposit_amount: u128,
    pub withdraw_amount: u128,
    pub output_token_field: Fr,
    pub output_eth_address: Fr,
    pub tree_number: u32,
    pub merkle_root: Fr,
    pub nullifiers: Vec<Fr>,
    pub commitments_out: Vec<Fr>,
    pub ciphertext_hash: Fr,
}

impl Erc20PrivateInputs {
    /// Checks the invariants that must hold before the prover runs, and
    /// resolves which circuit the input count selects.
    pub fn validate(&self) -> Result<Circuit, InputsError> {
        let circuit = Circuit::for_input_count(self.nullifiers.len())
            .ok_or(InputsError::BadInputCount(self.nullifiers.len()))?;

        if self.commitments_out.len() != CIRCUIT_OUTPUTS {
            return Err(InputsError::BadOutputCount(self.commitments_out.len()));
        }

        for (i, elements) in self.path_elements.iter().enumerate() {
            if elements.len() != TREE_DEPTH {
                return Err(InputsError::BadPathDepth(i));
            }
        }

        // Dummy inputs carry a zero value and an all-zero path; only real
        // inputs must prove inclusion against the root.
        for i in 0..self.values_in.len() {
            if self.values_in[i] == 0 {
                continue;
            }

            //? Safe to unwrap: spending keys are valid scalars by construction
            let (x, y) = self.spending_keys[i].public_key().unpack().unwrap();
            let commitment = crate::crypto::poseidon::poseidon_hash(&[
                x,
                y,
                Fr::from(self.values_in[i]),
                self.random_in[i],
                self.token_field,
            ]);
            let root = reconstruct_root(&self.path_elements[i], self.path_indices[i], commitment);
            if root != self.merkle_root {
                return Err(InputsError::PathMismatch(i));
            }
        }

        Ok(circuit)
    }

    pub fn public_inputs(&self) -> PublicInputs {
        PublicInputs {
            adapt_id: self.adapt_id,
            deposit_amount: self.deposit_amount,
            withdraw_amount: self.withdraw_amount,
            output_token_field: self.output_token_field,
            output_eth_address: self.output_eth_address,
            tree_number: self.tree_number,
            merkle_root: self.merkle_root,
            nullifiers: self.nullifiers.clone(),
            commitments_out: self.commitments_out.clone(),
            ciphertext_hash: self.ciphertext_hash,
        }
    }

    /// Flattens the assignment into named integer columns in circuit signal
    /// order.
    pub fn as_flat_map(&self) -> Vec<(String, Vec<BigInt>)> {
        let fr = fr_to_bigint;
        let mut map: Vec<(String, Vec<BigInt>)> = Vec::new();

        map.push(("adaptID".into(), vec![fr(&self.adapt_id.hash())]));
        map.push(("tokenField".into(), vec![fr(&self.token_field)]));
        map.push(("depositAmount".into(), vec![BigInt::from(self.deposit_amount)]));
        map.push((
            "withdrawAmount".into(),
            vec![BigInt::from(self.withdraw_amount)],
        ));
        map.push((
            "outputTokenField".into(),
            vec![fr(&self.output_token_field)],
        ));
        map.push((
            "outputEthAddress".into(),
            vec![fr(&self.output_eth_address)],
        ));
        map.push((
            "randomIn".into(),
            self.random_in.iter().map(fr).collect(),
        ));
        map.push((
            "valuesIn".into(),
            self.values_in.iter().map(|v| BigInt::from(*v)).collect(),
        ));
        map.push((
            "spendingKeys".into(),
            self.spending_keys.iter().map(|k| k.to_bigint()).collect(),
        ));
        map.push(("treeNumber".into(), vec![BigInt::from(self.tree_number)]));
        map.push(("merkleRoot".into(), vec![fr(&self.merkle_root)]));
        map.push(("nullifiers".into(), self.nullifiers.iter().map(fr).collect()));
        map.push((
            "pathElements".into(),
            self.path_elements.iter().flatten().map(fr).collect(),
        ));
        map.push((
            "pathIndices".into(),
            self.path_indices.iter().map(|i| BigInt::from(*i)).collect(),
        ));
        map.push((
            "recipientPK".into(),
            self.recipient_pk
                .iter()
                .flat_map(|(x, y)| [fr(x), fr(y)])
                .collect(),
        ));
        map.push(("randomOut".into(), self.random_out.iter().map(fr).collect()));
        map.push((
            "valuesOut".into(),
            self.values_out.iter().map(|v| BigInt::from(*v)).collect(),
        ));
        map.push((
            "commitmentsOut".into(),
            self.commitments_out.iter().map(fr).collect(),
        ));
        map.push(("ciphertextHash".into(), vec![fr(&self.ciphertext_hash)]));

        map
    }

    /// The assignment as the JSON document the external witness generator
    /// consumes: every value a decimal string.
    pub fn witness_assignment(&self) -> Value {
        let mut doc = Map::new();
        for (name, values) in self.as_flat_map() {
            let column: Vec<Value> = values
                .into_iter()
                .map(|v| Value::String(v.to_str_radix(10)))
                .collect();
            doc.insert(name, Value::Array(column));
        }
        Value::Object(doc)
    }
}

impl PublicInputs {
    /// The circuit's single public input:
    /// `sha256(all bound values, each left-padded to 32 bytes) mod p`.
    ///
    /// The verifier always re-derives this; an externally supplied hash is
    /// never trusted.
    pub fn hash_of_inputs(&self) -> Fr {
        let mut data = Vec::new();
        data.extend_from_slice(&fr_to_bytes(&self.adapt_id.hash()));
        data.extend_from_slice(&pad_to_32(&self.deposit_amount.to_be_bytes()));
        data.extend_from_slice(&pad_to_32(&self.withdraw_amount.to_be_bytes()));
        data.extend_from_slice(&fr_to_bytes(&self.output_token_field));
        data.extend_from_slice(&fr_to_bytes(&self.output_eth_address));
        data.extend_from_slice(&pad_to_32(&self.tree_number.to_be_bytes()));
        data.extend_from_slice(&fr_to_bytes(&self.merkle_root));
        for nullifier in &self.nullifiers {
            data.extend_from_slice(&fr_to_bytes(nullifier));
        }
        for commitment in &self.commitments_out {
            data.extend_from_slice(&fr_to_bytes(commitment));
        }
        data.extend_from_slice(&fr_to_bytes(&self.ciphertext_hash));

        hash_to_scalar(&data)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;
    use tracing_test::traced_test;

    use crate::{
        merkle_tree::MerkleTree,
        note::{Erc20Note, TokenField},
    };

    use super::*;

    fn dummy_private_inputs(n_inputs: usize) -> Erc20PrivateInputs {
        let token = TokenField::from_address(address!(
            "0x1234567890123456789012345678901234567890"
        ));

        let mut spending_keys = Vec::new();
        let mut random_in = Vec::new();
        for i in 0..n_inputs {
            spending_keys.push(SpendingKey::from_seed(&[i as u8; 4]));
            random_in.push(Fr::from(i as u64));
        }

        Erc20PrivateInputs {
            adapt_id: AdaptId::default(),
            token_field: token.to_fr(),
            deposit_amount: 0,
            withdraw_amount: 0,
            output_token_field: Fr::from(0u64),
            output_eth_address: Fr::from(0u64),
            random_in,
            values_in: vec![0; n_inputs],
            spending_keys,
            tree_number: 0,
            merkle_root: Fr::from(1u64),
            nullifiers: vec![Fr::from(7u64); n_inputs],
            path_elements: vec![vec![Fr::from(0u64); TREE_DEPTH]; n_inputs],
            path_indices: vec![0; n_inputs],
            recipient_pk: vec![(Fr::from(1u64), Fr::from(2u64)); CIRCUIT_OUTPUTS],
            random_out: vec![Fr::from(3u64); CIRCUIT_OUTPUTS],
            values_out: vec![0; CIRCUIT_OUTPUTS],
            commitments_out: vec![Fr::from(4u64); CIRCUIT_OUTPUTS],
            ciphertext_hash: Fr::from(5u64),
        }
    }

    #[test]
    #[traced_test]
    fn test_validate_selects_circuit_by_arity() {
        assert_eq!(
            dummy_private_inputs(2).validate().unwrap(),
            Circuit::Erc20Small
        );
        assert_eq!(
            dummy_private_inputs(10).validate().unwrap(),
            Circuit::Erc20Large
        );
        assert!(matches!(
            dummy_private_inputs(3).validate(),
            Err(InputsError::BadInputCount(3))
        ));
    }

    #[test]
    #[traced_test]
    fn test_validate_checks_output_count() {
        let mut inputs = dummy_private_inputs(2);
        inputs.commitments_out.pop();
        assert!(matches!(
            inputs.validate(),
            Err(InputsError::BadOutputCount(2))
        ));
    }

    #[test]
    #[traced_test]
    fn test_validate_checks_path_depth() {
        let mut inputs = dummy_private_inputs(2);
        inputs.path_elements[1].pop();
        assert!(matches!(inputs.validate(), Err(InputsError::BadPathDepth(1))));
    }

    #[test]
    #[traced_test]
    fn test_validate_checks_real_input_inclusion() {
        let token = TokenField::from_address(address!(
            "0x1234567890123456789012345678901234567890"
        ));
        let key = SpendingKey::from_seed(b"real input");
        let note = Erc20Note::new(key.public_key(), [1u8; 16], 500, token);

        let mut tree = MerkleTree::new(0);
        tree.insert_leaves(&[note.commitment().unwrap()], 0);
        let proof = tree.generate_proof(0).unwrap();

        let mut inputs = dummy_private_inputs(2);
        inputs.spending_keys[0] = key;
        inputs.values_in[0] = note.amount;
        inputs.random_in[0] = note.random_fr();
        inputs.path_elements[0] = proof.elements;
        inputs.path_indices[0] = proof.indices;
        inputs.merkle_root = proof.root;

        inputs.validate().unwrap();

        // A real input with a broken path must be rejected.
        inputs.path_indices[0] ^= 1;
        assert!(matches!(inputs.validate(), Err(InputsError::PathMismatch(0))));
    }

    #[test]
    #[traced_test]
    fn test_hash_of_inputs_binds_every_field() {
        let inputs = dummy_private_inputs(2);
        let public = inputs.public_inputs();
        let baseline = public.hash_of_inputs();

        assert_eq!(baseline, inputs.public_inputs().hash_of_inputs());

        let mut mutated = public.clone();
        mutated.deposit_amount = 1;
        assert_ne!(baseline, mutated.hash_of_inputs());

        let mut mutated = public.clone();
        mutated.nullifiers[1] = Fr::from(8u64);
        assert_ne!(baseline, mutated.hash_of_inputs());

        let mut mutated = public.clone();
        mutated.tree_number = 2;
        assert_ne!(baseline, mutated.hash_of_inputs());

        let mut mutated = public.clone();
        mutated.ciphertext_hash = Fr::from(6u64);
        assert_ne!(baseline, mutated.hash_of_inputs());
    }

    #[test]
    #[traced_test]
    fn test_witness_assignment_shape() {
        let inputs = dummy_private_inputs(2);
        let doc = inputs.witness_assignment();

        let path_elements = doc["pathElements"].as_array().unwrap();
        assert_eq!(path_elements.len(), 2 * TREE_DEPTH);

        let recipient_pk = doc["recipientPK"].as_array().unwrap();
        assert_eq!(recipient_pk.len(), 2 * CIRCUIT_OUTPUTS);

        // Every value is a decimal string.
        assert_eq!(doc["treeNumber"][0], Value::String("0".into()));
        assert!(doc["merkleRoot"][0].as_str().unwrap().parse::<u128>().is_ok());
    }
}
