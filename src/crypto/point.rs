//! secp256k1 curve point arithmetic, wrapping `k256::ProjectivePoint`.

use k256::elliptic_curve::{
    point::AffineCoordinates,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    Group,
};
use std::ops::{Add, Neg};

use crate::crypto::scalar::Scalar;
use crate::errors::CryptoError;

/// A secp256k1 curve point, including the point at infinity ("identity").
#[derive(Clone, Copy, Debug)]
pub struct Point(k256::ProjectivePoint);

impl Point {
    pub fn generator() -> Self {
        Point(k256::ProjectivePoint::GENERATOR)
    }

    pub fn identity() -> Self {
        Point(k256::ProjectivePoint::IDENTITY)
    }

    pub fn is_identity(&self) -> bool {
        bool::from(self.0.is_identity())
    }

    pub fn mul(&self, scalar: &Scalar) -> Self {
        Point(self.0 * scalar.inner())
    }

    pub fn mul_generator(scalar: &Scalar) -> Self {
        Point::generator().mul(scalar)
    }

    pub fn negate(&self) -> Self {
        Point(-self.0)
    }

    /// `true` if the normalised affine y-coordinate is odd.
    pub fn y_is_odd(&self) -> bool {
        let affine = k256::AffinePoint::from(self.0);
        bool::from(affine.y_is_odd())
    }

    /// 33-byte SEC1 compressed encoding.
    pub fn serialize_compressed(&self) -> [u8; 33] {
        let affine = k256::AffinePoint::from(self.0);
        let encoded = affine.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    /// 32-byte BIP-340 x-only encoding (just the x-coordinate).
    pub fn serialize_xonly(&self) -> [u8; 32] {
        let affine = k256::AffinePoint::from(self.0);
        let encoded = affine.to_encoded_point(true);
        let mut out = [0u8; 32];
        out.copy_from_slice(&encoded.as_bytes()[1..]);
        out
    }

    pub fn deserialize_compressed(bytes: &[u8]) -> Result<Self, CryptoError> {
        let encoded = k256::EncodedPoint::from_bytes(bytes).map_err(|_| CryptoError::PointDecode)?;
        let affine: Option<k256::AffinePoint> = k256::AffinePoint::from_encoded_point(&encoded).into();
        affine.map(|a| Point(a.into())).ok_or(CryptoError::PointDecode)
    }

    /// Parses a 32-byte x-only public key, choosing the even-y
    /// representative (BIP-340 convention).
    pub fn deserialize_xonly(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let mut prefixed = [0u8; 33];
        prefixed[0] = 0x02;
        prefixed[1..].copy_from_slice(bytes);
        Point::deserialize_compressed(&prefixed)
    }

    /// Returns this point, negated if necessary so its y-coordinate is
    /// even. Returns whether the negation happened.
    pub fn normalized_even_y(&self) -> (Self, bool) {
        if self.y_is_odd() {
            (self.negate(), true)
        } else {
            (*self, false)
        }
    }

    pub(crate) fn inner(&self) -> k256::ProjectivePoint {
        self.0
    }

    pub(crate) fn from_inner(inner: k256::ProjectivePoint) -> Self {
        Point(inner)
    }
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        let a = k256::AffinePoint::from(self.0);
        let b = k256::AffinePoint::from(other.0);
        a == b
    }
}
impl Eq for Point {}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Self) -> Self::Output {
        Point(self.0 + rhs.0)
    }
}

impl Neg for Point {
    type Output = Point;
    fn neg(self) -> Self::Output {
        Point(-self.0)
    }
}

impl std::iter::Sum for Point {
    fn sum<I: Iterator<Item = Point>>(iter: I) -> Self {
        iter.fold(Point::identity(), |acc, p| acc + p)
    }
}
