use std::{
    fs,
    path::{Path, PathBuf},
};

use alloy::primitives::U256;
use ark_bn254::{Bn254, Fq, Fq2, Fr};
use ark_circom::{CircomBuilder, CircomConfig, CircomReduction, read_zkey};
use ark_ff::{BigInteger, PrimeField};
use ark_groth16::{Groth16, ProvingKey, prepare_verifying_key};
use tracing::info;

use crate::circuit::{
    Circuit,
    inputs::{Erc20PrivateInputs, PublicInputs},
    prover::{G1Affine, G2Affine, Proof, Prover, ProverError, swap_g2},
};

/// Groth16 prover over compiled circom artifacts on disk.
///
/// Expects `<dir>/<circuit>/<circuit>.{wasm,r1cs,zkey}` for each circuit.
pub struct NativeProver {
    artifact_dir: PathBuf,
}

impl NativeProver {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        NativeProver {
            artifact_dir: artifact_dir.into(),
        }
    }

    fn artifact_path(&self, circuit: Circuit, extension: &str) -> PathBuf {
        let name = circuit.artifact_name();
        self.artifact_dir.join(name).join(format!("{name}.{extension}"))
    }

    fn load_proving_key(&self, circuit: Circuit) -> Result<ProvingKey<Bn254>, ProverError> {
        let path = self.artifact_path(circuit, "zkey");
        let mut file = fs::File::open(&path)
            .map_err(|e| ProverError::MissingArtifact(format!("{}: {e}", path.display())))?;
        let (proving_key, _matrices) =
            read_zkey(&mut file).map_err(|e| ProverError::MissingArtifact(e.to_string()))?;
        Ok(proving_key)
    }

    fn load_builder(&self, circuit: Circuit) -> Result<CircomBuilder<Fr>, ProverError> {
        let wasm = self.artifact_path(circuit, "wasm");
        let r1cs = self.artifact_path(circuit, "r1cs");

        let cfg = CircomConfig::<Fr>::new(path_str(&wasm), path_str(&r1cs))
            .map_err(|e| ProverError::MissingArtifact(e.to_string()))?;
        Ok(CircomBuilder::new(cfg))
    }
}

impl Prover for NativeProver {
    fn prove(&self, circuit: Circuit, inputs: &Erc20PrivateInputs) -> Result<Proof, ProverError> {
        let selected = inputs.validate()?;
        if selected != circuit {
            return Err(ProverError::ProofGenFailed(format!(
                "inputs select {selected:?}, prover was asked for {circuit:?}"
            )));
        }

        let proving_key = self.load_proving_key(circuit)?;
        let mut builder = self.load_builder(circuit)?;

        for (name, values) in inputs.as_flat_map() {
            for value in values {
                builder.push_input(&name, value);
            }
        }

        let circom = builder
            .build()
            .map_err(|e| ProverError::ProofGenFailed(e.to_string()))?;
        let circuit_public = circom
            .get_public_inputs()
            .ok_or_else(|| ProverError::ProofGenFailed("witness has no public inputs".into()))?;

        // The witness generator must arrive at the same bound-input hash we
        // derive; a mismatch means the assignment drifted from the circuit.
        let expected_hash = inputs.public_inputs().hash_of_inputs();
        if circuit_public != [expected_hash] {
            return Err(ProverError::ProofGenFailed(
                "witness public input does not match the derived input hash".into(),
            ));
        }

        info!("Creating {:?} proof", circuit);
        let mut rng = ark_std::rand::thread_rng();
        let proof = Groth16::<Bn254, CircomReduction>::create_random_proof_with_reduction(
            circom,
            &proving_key,
            &mut rng,
        )
        .map_err(|e| ProverError::ProofGenFailed(e.to_string()))?;

        let pvk = prepare_verifying_key(&proving_key.vk);
        let verified =
            Groth16::<Bn254, CircomReduction>::verify_proof(&pvk, &proof, &circuit_public)
                .map_err(|e| ProverError::ProofGenFailed(e.to_string()))?;
        if !verified {
            return Err(ProverError::ProofGenFailed(
                "proof failed self-verification".into(),
            ));
        }

        info!("Proof created and self-verified");
        Ok(to_contract_proof(&proof))
    }

    fn verify(
        &self,
        circuit: Circuit,
        public: &PublicInputs,
        proof: &Proof,
    ) -> Result<bool, ProverError> {
        let proving_key = self.load_proving_key(circuit)?;
        let pvk = prepare_verifying_key(&proving_key.vk);

        let native = from_contract_proof(proof);
        let hash = public.hash_of_inputs();

        Groth16::<Bn254, CircomReduction>::verify_proof(&pvk, &native, &[hash])
            .map_err(|e| ProverError::ProofVerifyFailed(e.to_string()))
    }
}

/// Converts a native proof into the on-chain encoding, swapping the G2
/// inner pairs.
fn to_contract_proof(proof: &ark_groth16::Proof<Bn254>) -> Proof {
    Proof {
        a: G1Affine {
            x: fq_to_u256(&proof.a.x),
            y: fq_to_u256(&proof.a.y),
        },
        b: swap_g2(&G2Affine {
            x: [fq_to_u256(&proof.b.x.c0), fq_to_u256(&proof.b.x.c1)],
            y: [fq_to_u256(&proof.b.y.c0), fq_to_u256(&proof.b.y.c1)],
        }),
        c: G1Affine {
            x: fq_to_u256(&proof.c.x),
            y: fq_to_u256(&proof.c.y),
        },
    }
}

/// Restores the prover-native G2 ordering before a Groth16 verify call.
fn from_contract_proof(proof: &Proof) -> ark_groth16::Proof<Bn254> {
    let b = swap_g2(&proof.b);
    ark_groth16::Proof {
        a: ark_bn254::G1Affine::new_unchecked(u256_to_fq(&proof.a.x), u256_to_fq(&proof.a.y)),
        b: ark_bn254::G2Affine::new_unchecked(
            Fq2::new(u256_to_fq(&b.x[0]), u256_to_fq(&b.x[1])),
            Fq2::new(u256_to_fq(&b.y[0]), u256_to_fq(&b.y[1])),
        ),
        c: ark_bn254::G1Affine::new_unchecked(u256_to_fq(&proof.c.x), u256_to_fq(&proof.c.y)),
    }
}

fn fq_to_u256(fq: &Fq) -> U256 {
    let bytes: [u8; 32] = fq.into_bigint().to_bytes_be().try_into().unwrap();
    U256::from_be_bytes::<32>(bytes)
}

fn u256_to_fq(value: &U256) -> Fq {
    Fq::from_be_bytes_mod_order(&value.to_be_bytes::<32>())
}

fn path_str(path: &Path) -> &str {
    //? Safe to unwrap: artifact paths are built from UTF-8 circuit names
    path.to_str().unwrap()
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn test_contract_proof_roundtrip() {
        let native = ark_groth16::Proof::<Bn254> {
            a: ark_bn254::G1Affine::new_unchecked(Fq::from(1u64), Fq::from(2u64)),
            b: ark_bn254::G2Affine::new_unchecked(
                Fq2::new(Fq::from(3u64), Fq::from(4u64)),
                Fq2::new(Fq::from(5u64), Fq::from(6u64)),
            ),
            c: ark_bn254::G1Affine::new_unchecked(Fq::from(7u64), Fq::from(8u64)),
        };

        let contract = to_contract_proof(&native);

        // Inner pairs are swapped on the way out.
        assert_eq!(contract.b.x, [U256::from(4u64), U256::from(3u64)]);
        assert_eq!(contract.b.y, [U256::from(6u64), U256::from(5u64)]);

        // And restored on the way back in.
        let restored = from_contract_proof(&contract);
        assert_eq!(restored.a, native.a);
        assert_eq!(restored.b, native.b);
        assert_eq!(restored.c, native.c);
    }

    #[test]
    #[traced_test]
    fn test_missing_artifacts_surface_cleanly() {
        let prover = NativeProver::new("/nonexistent/artifacts");
        let result = prover.load_proving_key(Circuit::Erc20Small);
        assert!(matches!(result, Err(ProverError::MissingArtifact(_))));
    }
}
