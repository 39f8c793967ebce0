//! secp256k1 scalar field arithmetic, wrapping `k256::Scalar`.

use k256::elliptic_curve::{
    ff::{Field, PrimeField},
    generic_array::GenericArray,
    ops::Reduce,
};
use k256::U256;
use rand_core::CryptoRngCore;
use std::ops::{Add, Mul, Neg};

use crate::errors::CryptoError;

/// An element of the secp256k1 scalar field (modulo the group order `n`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scalar(k256::Scalar);

impl Scalar {
    pub const ZERO: Scalar = Scalar(k256::Scalar::ZERO);
    pub const ONE: Scalar = Scalar(k256::Scalar::ONE);

    pub fn from_u32(value: u32) -> Self {
        Scalar(k256::Scalar::from(value as u64))
    }

    /// Interprets 32 big-endian bytes as an integer and reduces it modulo
    /// the group order, matching `secp256k1_scalar_set_b32`.
    pub fn from_bytes_mod_order(bytes: &[u8; 32]) -> Self {
        Scalar(<k256::Scalar as Reduce<U256>>::reduce_bytes(GenericArray::from_slice(bytes)))
    }

    /// Parses 32 bytes as a canonical (non-overflowing) scalar.
    pub fn from_canonical_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let repr = GenericArray::clone_from_slice(bytes);
        let candidate: Option<k256::Scalar> = k256::Scalar::from_repr(repr).into();
        candidate.map(Scalar).ok_or(CryptoError::ScalarOverflow)
    }

    pub fn serialize(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }

    pub fn random(rng: &mut impl CryptoRngCore) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes_mod_order(&bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero().into()
    }

    pub fn negate(&self) -> Self {
        Scalar(-self.0)
    }

    pub fn invert(&self) -> Result<Self, CryptoError> {
        let inv: Option<k256::Scalar> = self.0.invert().into();
        inv.map(Scalar).ok_or(CryptoError::ScalarNotInvertible)
    }

    pub(crate) fn inner(&self) -> k256::Scalar {
        self.0
    }

    pub(crate) fn from_inner(inner: k256::Scalar) -> Self {
        Scalar(inner)
    }
}

impl Add for Scalar {
    type Output = Scalar;
    fn add(self, rhs: Self) -> Self::Output {
        Scalar(self.0 + rhs.0)
    }
}

impl Mul for Scalar {
    type Output = Scalar;
    fn mul(self, rhs: Self) -> Self::Output {
        Scalar(self.0 * rhs.0)
    }
}

impl Neg for Scalar {
    type Output = Scalar;
    fn neg(self) -> Self::Output {
        Scalar(-self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_neg_is_zero() {
        let a = Scalar::from_u32(7);
        assert!((a + a.negate()).is_zero());
    }

    #[test]
    fn invert_round_trips() {
        let a = Scalar::from_u32(42);
        let inv = a.invert().unwrap();
        assert_eq!(a * inv, Scalar::ONE);
    }

    #[test]
    fn zero_has_no_inverse() {
        assert!(Scalar::ZERO.invert().is_err());
    }

    #[test]
    fn serialize_round_trips() {
        let a = Scalar::from_u32(12345);
        let bytes = a.serialize();
        let b = Scalar::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(a, b);
    }
}
