use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit::{
    Circuit,
    inputs::{Erc20PrivateInputs, InputsError, PublicInputs},
};

/// A Groth16 proof in the on-chain verifier's encoding: each G2 coordinate
/// pair is stored inner-swapped relative to the prover's native output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub a: G1Affine,
    pub b: G2Affine,
    pub c: G1Affine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct G1Affine {
    pub x: U256,
    pub y: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct G2Affine {
    pub x: [U256; 2],
    pub y: [U256; 2],
}

/// Swaps the inner coordinate pairs of a G2 point.
///
/// The on-chain verifier consumes `(c1, c0)` where the prover emits
/// `(c0, c1)`; applying the swap twice restores the original.
pub fn swap_g2(point: &G2Affine) -> G2Affine {
    G2Affine {
        x: [point.x[1], point.x[0]],
        y: [point.y[1], point.y[0]],
    }
}

#[derive(Debug, Error)]
pub enum ProverError {
    #[error("Invalid private inputs: {0}")]
    InvalidInputs(#[from] InputsError),
    #[error("Proof generation failed: {0}")]
    ProofGenFailed(String),
    #[error("Proof verification failed: {0}")]
    ProofVerifyFailed(String),
    #[error("Missing circuit artifact: {0}")]
    MissingArtifact(String),
}

/// Drives proof generation and verification for the spend circuits.
///
/// Proving may block for seconds; implementations are never called under a
/// lock.
pub trait Prover: Send + Sync {
    /// Generates a proof for `inputs` and self-verifies it before
    /// returning. A proof that fails its own verification surfaces as
    /// `ProofGenFailed`.
    fn prove(&self, circuit: Circuit, inputs: &Erc20PrivateInputs) -> Result<Proof, ProverError>;

    /// Verifies a proof against the hash re-derived from `public`.
    fn verify(
        &self,
        circuit: Circuit,
        public: &PublicInputs,
        proof: &Proof,
    ) -> Result<bool, ProverError>;
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn test_g2() -> G2Affine {
        G2Affine {
            x: [U256::from(1u64), U256::from(2u64)],
            y: [U256::from(3u64), U256::from(4u64)],
        }
    }

    #[test]
    #[traced_test]
    fn test_swap_g2_reorders_pairs() {
        let swapped = swap_g2(&test_g2());
        assert_eq!(swapped.x, [U256::from(2u64), U256::from(1u64)]);
        assert_eq!(swapped.y, [U256::from(4u64), U256::from(3u64)]);
    }

    #[test]
    #[traced_test]
    fn test_swap_g2_is_involutive() {
        let point = test_g2();
        assert_eq!(swap_g2(&swap_g2(&point)), point);
    }
}
