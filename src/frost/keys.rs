//! FROST key material: keypairs and trusted-dealer key generation.
//!
//! Grounded on `original_source/src/frost/frost.cpp`'s `keygen_with_dealer`
//! and `generate_shares` (Shamir secret sharing over the scalar field via
//! Horner's method), generalized to always hand back a BIP-340-compatible
//! (even-y) group public key the way `keys::KeyData::address` in the
//! teacher crate insists on an even-y internal key for Taproot.

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use std::collections::BTreeMap;

use crate::crypto::{Point, Scalar};

/// A replica's threshold key share, plus the group's aggregate public key.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
pub struct Keypair {
    /// 1-based signer index (never zero).
    pub index: u16,
    #[serde_as(as = "Hex")]
    secret_bytes: [u8; 32],
    #[serde_as(as = "Hex")]
    public_bytes: [u8; 33],
    #[serde_as(as = "Hex")]
    group_public_bytes: [u8; 33],
}

impl Keypair {
    pub fn secret(&self) -> Scalar {
        Scalar::from_canonical_bytes(&self.secret_bytes).expect("persisted keypair holds a canonical scalar")
    }

    pub fn public(&self) -> Point {
        Point::deserialize_compressed(&self.public_bytes).expect("persisted keypair holds a valid point")
    }

    pub fn group_public(&self) -> Point {
        Point::deserialize_compressed(&self.group_public_bytes).expect("persisted keypair holds a valid point")
    }

    fn new(index: u16, secret: Scalar, public: Point, group_public: Point) -> Self {
        Keypair {
            index,
            secret_bytes: secret.serialize(),
            public_bytes: public.serialize_compressed(),
            group_public_bytes: group_public.serialize_compressed(),
        }
    }
}

/// Output of a trusted-dealer key generation run: one [`Keypair`] per
/// participant plus the shared group public key.
pub struct DealerKeyGen {
    pub threshold: u16,
    pub total: u16,
    pub group_public: Point,
    pub shares: BTreeMap<u16, Keypair>,
}

/// Evaluates a polynomial with the given coefficients (lowest degree
/// first, `coefficients[0]` is the constant term) at `x` via Horner's
/// method.
fn evaluate_polynomial(coefficients: &[Scalar], x: u16) -> Scalar {
    let x = Scalar::from_u32(x as u32);
    let mut value = Scalar::ZERO;
    for coeff in coefficients.iter().rev() {
        value = value * x + *coeff;
    }
    value
}

/// Runs Shamir secret sharing with a trusted dealer: generates `total`
/// shares of a fresh random secret such that any `threshold` of them
/// reconstruct it, and normalizes the group public key to even-y so the
/// result is directly usable as a BIP-340/Taproot internal key.
pub fn generate_with_dealer(threshold: u16, total: u16, rng: &mut impl CryptoRngCore) -> DealerKeyGen {
    assert!(threshold >= 1 && threshold <= total, "threshold must be in [1, total]");

    let secret = Scalar::random(rng);
    let mut coefficients = vec![secret];
    for _ in 1..threshold {
        coefficients.push(Scalar::random(rng));
    }

    let group_public_raw = Point::mul_generator(&coefficients[0]);
    let (group_public, negated) = group_public_raw.normalized_even_y();

    let mut shares = BTreeMap::new();
    for index in 1..=total {
        let mut value = evaluate_polynomial(&coefficients, index);
        if negated {
            value = value.negate();
        }
        let public = Point::mul_generator(&value);
        shares.insert(index, Keypair::new(index, value, public, group_public));
    }

    DealerKeyGen { threshold, total, group_public, shares }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn dealer_keygen_produces_even_y_group_key() {
        let kg = generate_with_dealer(2, 3, &mut OsRng);
        assert_eq!(kg.shares.len(), 3);
        assert!(!kg.group_public.y_is_odd());
    }

    #[test]
    fn shares_reconstruct_the_group_secret() {
        let kg = generate_with_dealer(2, 3, &mut OsRng);
        // Lagrange-interpolate at 0 using shares {1, 2}.
        let indices = [1u16, 2u16];
        let mut secret = Scalar::ZERO;
        for &i in &indices {
            let mut num = Scalar::ONE;
            let mut den = Scalar::ONE;
            for &j in &indices {
                if j == i {
                    continue;
                }
                num = num * Scalar::from_u32(j as u32).negate();
                den = den * (Scalar::from_u32(j as u32).negate() + Scalar::from_u32(i as u32));
            }
            let lambda = num * den.invert().unwrap();
            secret = secret + kg.shares[&i].secret() * lambda;
        }
        assert_eq!(Point::mul_generator(&secret), kg.group_public);
    }
}
