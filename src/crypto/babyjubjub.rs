//! Baby-Jubjub group operations over the packed 32-byte point encoding.
//!
//! The curve is twisted Edwards `a·x² + y² = 1 + d·x²·y²` over the BN254
//! scalar field, with the circuit's Base8 generator. A packed point is the
//! little-endian y-coordinate with the sign of x in the high bit.

use std::str::FromStr;

use ark_bn254::Fr;
use ark_ff::{AdditiveGroup, BigInteger, Field, PrimeField};
use num_bigint::{BigInt, Sign};
use thiserror::Error;

use crate::crypto::sha256;

const A: u64 = 168700;
const D: u64 = 168696;

const B8_X: &str = "5299619240641551281634865583518297030282874472190772894086521144482721001553";
const B8_Y: &str = "16950150798460657717958625567821834550301663161624707787222815936182638968203";

#[derive(Debug, Error)]
pub enum BabyJubjubError {
    #[error("Invalid point encoding: {0}")]
    InvalidPoint(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: Fr,
    pub y: Fr,
}

#[derive(Clone, Debug)]
struct PointProjective {
    x: Fr,
    y: Fr,
    z: Fr,
}

/// The prime-order subgroup generator used for key derivation.
pub fn b8() -> Point {
    //? Safe to unwrap: the generator coordinates are in-field constants
    Point {
        x: Fr::from_str(B8_X).unwrap(),
        y: Fr::from_str(B8_Y).unwrap(),
    }
}

/// Derives the packed public key for a private scalar: `pack(sk · B8)`.
pub fn private_to_public(sk: &[u8; 32]) -> [u8; 32] {
    let scalar = BigInt::from_bytes_be(Sign::Plus, sk);
    b8().mul_scalar(&scalar).compress()
}

/// Unpacks a point into its `(x, y)` affine coordinates.
pub fn unpack_point(packed: &[u8; 32]) -> Result<(Fr, Fr), BabyJubjubError> {
    let point = Point::decompress(packed)?;
    Ok((point.x, point.y))
}

/// Packs `(x, y)` affine coordinates into the 32-byte encoding.
pub fn pack_point(x: &Fr, y: &Fr) -> [u8; 32] {
    Point { x: *x, y: *y }.compress()
}

/// Computes the ECDH shared secret `sha256(pack(sk · unpack(pk)))`.
///
/// The digest is used directly as an AES-256 key for note ciphertexts.
pub fn ecdh(sk: &[u8; 32], their_packed: &[u8; 32]) -> Result<[u8; 32], BabyJubjubError> {
    let their_point = Point::decompress(their_packed)?;
    let scalar = BigInt::from_bytes_be(Sign::Plus, sk);
    let shared = their_point.mul_scalar(&scalar);
    Ok(sha256(&shared.compress()))
}

impl Point {
    pub fn mul_scalar(&self, n: &BigInt) -> Point {
        // double-and-add over the projective form
        let mut r = PointProjective {
            x: Fr::ZERO,
            y: Fr::ONE,
            z: Fr::ONE,
        };
        let mut exp = self.projective();

        let (_, bytes) = n.to_bytes_le();
        let bits = n.bits() as usize;

        for i in 0..bits {
            if test_bit(&bytes, i) {
                r = r.add(&exp);
            }
            exp = exp.add(&exp);
        }

        r.affine()
    }

    pub fn compress(&self) -> [u8; 32] {
        //? Safe to unwrap: a field element is always 32 little-endian bytes
        let mut bytes: [u8; 32] = self.y.into_bigint().to_bytes_le().try_into().unwrap();
        if self.x.into_bigint() > Fr::MODULUS_MINUS_ONE_DIV_TWO {
            bytes[31] |= 0x80;
        }
        bytes
    }

    pub fn decompress(packed: &[u8; 32]) -> Result<Point, BabyJubjubError> {
        let mut bytes = *packed;
        let sign = bytes[31] & 0x80 != 0;
        bytes[31] &= 0x7f;

        let y = Fr::from_le_bytes_mod_order(&bytes);
        if y.into_bigint().to_bytes_le() != bytes {
            return Err(BabyJubjubError::InvalidPoint(
                "y outside the field".to_string(),
            ));
        }

        // x² = (1 - y²) / (a - d·y²)
        let y2 = y.square();
        let denominator = Fr::from(A) - Fr::from(D) * y2;
        let x2 = (Fr::ONE - y2)
            * denominator
                .inverse()
                .ok_or_else(|| BabyJubjubError::InvalidPoint("degenerate y".to_string()))?;

        let mut x = x2
            .sqrt()
            .ok_or_else(|| BabyJubjubError::InvalidPoint("not on the curve".to_string()))?;

        // Normalize to the non-negative root, then apply the sign bit.
        if x.into_bigint() > Fr::MODULUS_MINUS_ONE_DIV_TWO {
            x = -x;
        }
        if sign {
            x = -x;
        }

        Ok(Point { x, y })
    }

    fn projective(&self) -> PointProjective {
        PointProjective {
            x: self.x,
            y: self.y,
            z: Fr::ONE,
        }
    }
}

impl PointProjective {
    fn affine(&self) -> Point {
        if self.z == Fr::ZERO {
            return Point {
                x: Fr::ZERO,
                y: Fr::ZERO,
            };
        }

        //? Safe to unwrap: z is nonzero here
        let zinv = self.z.inverse().unwrap();
        Point {
            x: self.x * zinv,
            y: self.y * zinv,
        }
    }

    fn add(&self, q: &PointProjective) -> PointProjective {
        // add-2008-bbjlp
        // https://hyperelliptic.org/EFD/g1p/auto-twisted-projective.html#addition-add-2008-bbjlp
        let d = Fr::from(D);
        let a_coeff = Fr::from(A);

        let a = self.z * q.z;
        let b = a.square();
        let c = self.x * q.x;
        let dxy = self.y * q.y;

        let e = d * c * dxy;

        let f = b - e;
        let g = b + e;

        let aux = (self.x + self.y) * (q.x + q.y) - c - dxy;
        let x3 = a * f * aux;

        let ac = a_coeff * c;
        let dac = dxy - ac;
        let y3 = a * g * dac;

        let z3 = f * g;

        PointProjective {
            x: x3,
            y: y3,
            z: z3,
        }
    }
}

fn test_bit(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn on_curve(point: &Point) -> bool {
        let x2 = point.x.square();
        let y2 = point.y.square();
        Fr::from(A) * x2 + y2 == Fr::ONE + Fr::from(D) * x2 * y2
    }

    #[test]
    #[traced_test]
    fn test_generator_is_on_curve() {
        assert!(on_curve(&b8()));
    }

    #[test]
    #[traced_test]
    fn test_public_keys_stay_on_curve() {
        for seed in 1u8..=5 {
            let packed = private_to_public(&[seed; 32]);
            let point = Point::decompress(&packed).unwrap();
            assert!(on_curve(&point));
        }
    }

    #[test]
    #[traced_test]
    fn test_pack_unpack_roundtrip() {
        let packed = private_to_public(&[7u8; 32]);

        let (x, y) = unpack_point(&packed).unwrap();
        assert_eq!(pack_point(&x, &y), packed);
    }

    #[test]
    #[traced_test]
    fn test_unpack_rejects_invalid_encoding() {
        // The masked y-coordinate is far above the field modulus.
        let result = unpack_point(&[0xff; 32]);
        assert!(matches!(result, Err(BabyJubjubError::InvalidPoint(_))));
    }

    #[test]
    #[traced_test]
    fn test_scalar_mul_distributes() {
        // (2 + 3)·B8 == 2·B8 + 3·B8
        let lhs = b8().mul_scalar(&BigInt::from(5));
        let rhs = b8()
            .mul_scalar(&BigInt::from(2))
            .projective()
            .add(&b8().mul_scalar(&BigInt::from(3)).projective())
            .affine();

        assert_eq!(lhs, rhs);
    }

    #[test]
    #[traced_test]
    fn test_ecdh_is_symmetric() {
        let sk_a = [3u8; 32];
        let sk_b = [9u8; 32];
        let pk_a = private_to_public(&sk_a);
        let pk_b = private_to_public(&sk_b);

        let shared_ab = ecdh(&sk_a, &pk_b).unwrap();
        let shared_ba = ecdh(&sk_b, &pk_a).unwrap();

        assert_eq!(shared_ab, shared_ba);
    }

    #[test]
    #[traced_test]
    fn test_distinct_keys_distinct_secrets() {
        let pk = private_to_public(&[5u8; 32]);

        let shared_a = ecdh(&[3u8; 32], &pk).unwrap();
        let shared_b = ecdh(&[4u8; 32], &pk).unwrap();

        assert_ne!(shared_a, shared_b);
    }
}
