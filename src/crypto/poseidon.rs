use ark_bn254::Fr;
use light_poseidon::PoseidonHasher;

//? `light_poseidon` implements the same parameterization as the circuit's
//? circom Poseidon, and is much faster than the older `poseidon-rs` port.
pub fn poseidon_hash(inputs: &[Fr]) -> Fr {
    let mut poseidon = light_poseidon::Poseidon::<Fr>::new_circom(inputs.len()).unwrap();
    poseidon.hash(inputs).unwrap()
}
