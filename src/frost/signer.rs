//! FROST round-1/round-2/aggregation/verify (C2), grounded on
//! `original_source/src/frost/frost.cpp` (`preprocess`, `compute_binding_factor`,
//! `compute_group_commitment`, `sign_internal`, `aggregate`, `validate`),
//! adapted to the design note's option (b): the odd-`R` per-share
//! verification negates the commitment point instead of skipping the
//! check.

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::hash::{h1_rho, h4_msg, h5_com, tagged_hash};
use crate::crypto::{Point, Scalar};
use crate::errors::FrostError;
use crate::frost::keys::Keypair;

/// The public half of a round-1 nonce pair: `{index, D = d·G, E = e·G}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningCommitment {
    pub index: u16,
    pub hiding: PointBytes,
    pub binding: PointBytes,
}

/// 33-byte compressed point, serializable for the wire envelope.
pub type PointBytes = [u8; 33];

fn to_point(bytes: &PointBytes) -> Point {
    Point::deserialize_compressed(bytes).expect("on-wire commitment is always a valid point")
}

impl SigningCommitment {
    pub fn new(index: u16, hiding: Point, binding: Point) -> Self {
        SigningCommitment { index, hiding: hiding.serialize_compressed(), binding: binding.serialize_compressed() }
    }

    fn hiding_point(&self) -> Point {
        to_point(&self.hiding)
    }

    fn binding_point(&self) -> Point {
        to_point(&self.binding)
    }
}

/// The private half of a round-1 nonce pair. Round-2 signing consumes this
/// by value; the replica's wallet is the sole owner and must not retain a
/// reusable copy (§3 "Keypair lifecycle").
#[derive(Clone, Copy)]
pub struct NoncePair {
    pub hiding_secret: Scalar,
    pub binding_secret: Scalar,
}

/// Generates a fresh round-1 nonce pair and its public commitment.
///
/// `commit(hiding_seed, binding_seed) -> (d, D=d·G, e, E=e·G)`: the caller
/// retains the private halves (`NoncePair`) and publishes the commitment.
pub fn commit(index: u16, rng: &mut impl CryptoRngCore) -> (NoncePair, SigningCommitment) {
    let hiding_secret = Scalar::random(rng);
    let binding_secret = Scalar::random(rng);
    let hiding_point = Point::mul_generator(&hiding_secret);
    let binding_point = Point::mul_generator(&binding_secret);
    (NoncePair { hiding_secret, binding_secret }, SigningCommitment::new(index, hiding_point, binding_point))
}

/// Encodes the sorted commitment list for `H5`, matching
/// `encode_group_commitments` in the original: each entry is
/// `serialize_scalar(index) || xonly(D) || xonly(E)`.
fn encode_commitment_list(sorted: &[SigningCommitment]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(sorted.len() * (32 + 32 + 32));
    for c in sorted {
        buf.extend_from_slice(&Scalar::from_u32(c.index as u32).serialize());
        buf.extend_from_slice(&c.hiding_point().serialize_xonly());
        buf.extend_from_slice(&c.binding_point().serialize_xonly());
    }
    buf
}

/// The binding factor `ρ_i = H1(H4(m) || H5(encoded_commitments) || ser(i))`.
fn binding_factor(index: u16, msg: &[u8], sorted_commitments: &[SigningCommitment]) -> Scalar {
    let msg_hash = h4_msg(msg);
    let commitments_hash = h5_com(&encode_commitment_list(sorted_commitments));

    let mut rho_input = Vec::with_capacity(32 + 32 + 32);
    rho_input.extend_from_slice(&msg_hash);
    rho_input.extend_from_slice(&commitments_hash);
    rho_input.extend_from_slice(&Scalar::from_u32(index as u32).serialize());

    Scalar::from_bytes_mod_order(&h1_rho(&rho_input))
}

/// Computes the binding factor for every signer in `commitments`, keyed by
/// index. Commitments are sorted by index before the commitment-list hash
/// is taken, per spec §4.2.
fn binding_factors(msg: &[u8], commitments: &[SigningCommitment]) -> Result<BTreeMap<u16, Scalar>, FrostError> {
    let mut sorted = commitments.to_vec();
    sorted.sort_by_key(|c| c.index);
    if has_duplicate_index(&sorted) {
        return Err(FrostError::DuplicateIndex);
    }

    Ok(sorted.iter().map(|c| (c.index, binding_factor(c.index, msg, &sorted))).collect())
}

fn has_duplicate_index(sorted: &[SigningCommitment]) -> bool {
    sorted.windows(2).any(|w| w[0].index == w[1].index)
}

/// The group commitment `R = Σ(D_i + ρ_i·E_i)`, plus whether its
/// normalised y-coordinate is odd (the BIP-340 "R is odd" case).
fn group_commitment(commitments: &[SigningCommitment], bindings: &BTreeMap<u16, Scalar>) -> (Point, bool) {
    let r = commitments
        .iter()
        .map(|c| {
            let rho_i = bindings[&c.index];
            c.hiding_point() + c.binding_point().mul(&rho_i)
        })
        .fold(Point::identity(), |acc, term| acc + term);

    let is_odd = r.y_is_odd();
    (r, is_odd)
}

/// The Lagrange coefficient of `signer_index` at `x = 0` over
/// `all_indices`, matching `derive_lagrange_coefficient` in the original.
pub fn lagrange_coefficient(signer_index: u16, all_indices: &[u16]) -> Result<Scalar, FrostError> {
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for &j in all_indices {
        if j == signer_index {
            continue;
        }
        let j = Scalar::from_u32(j as u32);
        let i = Scalar::from_u32(signer_index as u32);
        num = num * (j + i.negate());
        den = den * (j + i.negate());
    }
    if den.is_zero() {
        return Err(FrostError::DuplicateShares);
    }
    Ok(num * den.invert()?)
}

/// The BIP-340 Schnorr challenge `e = H(R.x || P.x || m)`.
pub fn challenge(group_public: &Point, group_commitment: &Point, msg: &[u8]) -> Scalar {
    let mut buf = Vec::with_capacity(32 + 32 + msg.len());
    buf.extend_from_slice(&group_commitment.serialize_xonly());
    buf.extend_from_slice(&group_public.serialize_xonly());
    buf.extend_from_slice(msg);
    Scalar::from_bytes_mod_order(&tagged_hash("BIP0340/challenge", &buf))
}

/// Round-2 signature share: `z_i' = ±(d_i + ρ_i·e_i + λ_i·s_i·e)`, with the
/// BIP-340 sign flip applied when the group commitment is odd
/// (`z_i' = -z_i + 2·λ_i·s_i·e`).
pub fn sign(
    keypair: &Keypair,
    nonce: NoncePair,
    commitments: &[SigningCommitment],
    msg: &[u8],
) -> Result<Scalar, FrostError> {
    let bindings = binding_factors(msg, commitments)?;
    let all_indices: Vec<u16> = commitments.iter().map(|c| c.index).collect();

    let (_r, r_is_odd) = group_commitment(commitments, &bindings);
    let lambda_i = lagrange_coefficient(keypair.index, &all_indices)?;
    let e = challenge(&keypair.group_public(), &_r, msg);
    let rho_i = bindings[&keypair.index];

    let mut z_i = nonce.hiding_secret + nonce.binding_secret * rho_i + lambda_i * keypair.secret() * e;
    if r_is_odd {
        let adjustment = Scalar::from_u32(2) * lambda_i * keypair.secret() * e;
        z_i = z_i.negate() + adjustment;
    }
    Ok(z_i)
}

/// A finalised 64-byte BIP-340 Schnorr signature: `R.x || z`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    pub r_xonly: [u8; 32],
    pub z: [u8; 32],
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r_xonly);
        out[32..].copy_from_slice(&self.z);
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut r_xonly = [0u8; 32];
        let mut z = [0u8; 32];
        r_xonly.copy_from_slice(&bytes[..32]);
        z.copy_from_slice(&bytes[32..]);
        Signature { r_xonly, z }
    }
}

/// Verifies each signer's share, negating its commitment point when the
/// group commitment is odd (design note, option (b)), then aggregates into
/// a single BIP-340 signature.
pub fn aggregate(
    msg: &[u8],
    group_public: &Point,
    commitments: &[SigningCommitment],
    shares: &BTreeMap<u16, Scalar>,
    signer_public_keys: &BTreeMap<u16, Point>,
) -> Result<Signature, FrostError> {
    if commitments.len() != shares.len() {
        return Err(FrostError::MismatchedCommitmentsAndResponses);
    }

    let bindings = binding_factors(msg, commitments)?;
    let all_indices: Vec<u16> = commitments.iter().map(|c| c.index).collect();
    let (r, r_is_odd) = group_commitment(commitments, &bindings);
    let e = challenge(group_public, &r, msg);

    let by_index: BTreeMap<u16, &SigningCommitment> = commitments.iter().map(|c| (c.index, c)).collect();

    for (&index, &z_i) in shares {
        let commitment = by_index.get(&index).ok_or(FrostError::UnknownSigner { signer: index })?;
        let signer_pubkey = signer_public_keys.get(&index).ok_or(FrostError::UnknownSigner { signer: index })?;
        let rho_i = bindings[&index];
        let lambda_i = lagrange_coefficient(index, &all_indices)?;

        let mut commitment_i = commitment.hiding_point() + commitment.binding_point().mul(&rho_i);
        if r_is_odd {
            commitment_i = commitment_i.negate();
        }

        let lhs = Point::mul_generator(&z_i);
        let rhs = commitment_i + signer_pubkey.mul(&(lambda_i * e));
        if lhs != rhs {
            return Err(FrostError::InvalidSignerResponse { signer: index });
        }
    }

    let z: Scalar = shares.values().copied().fold(Scalar::ZERO, |acc, z_i| acc + z_i);
    let r_final = if r_is_odd { r.negate() } else { r };

    Ok(Signature { r_xonly: r_final.serialize_xonly(), z: z.serialize() })
}

/// Standard BIP-340 Schnorr verification: `z·G − e·P == R`.
pub fn verify(msg: &[u8], signature: &Signature, group_public: &Point) -> bool {
    let Ok(r) = Point::deserialize_xonly(&signature.r_xonly) else {
        return false;
    };
    let Ok(z) = Scalar::from_canonical_bytes(&signature.z) else {
        return false;
    };
    let e = challenge(group_public, &r, msg);
    let lhs = Point::mul_generator(&z);
    let rhs = r + group_public.mul(&e);
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frost::keys::generate_with_dealer;
    use rand::rngs::OsRng;

    fn run_ceremony(threshold: u16, total: u16, signer_indices: &[u16], msg: &[u8]) -> (Point, Signature) {
        let kg = generate_with_dealer(threshold, total, &mut OsRng);

        let mut nonces = BTreeMap::new();
        let mut commitments = Vec::new();
        for &idx in signer_indices {
            let (nonce, commitment) = commit(idx, &mut OsRng);
            nonces.insert(idx, nonce);
            commitments.push(commitment);
        }

        let mut shares = BTreeMap::new();
        let mut pubkeys = BTreeMap::new();
        for &idx in signer_indices {
            let keypair = &kg.shares[&idx];
            let z = sign(keypair, nonces[&idx], &commitments, msg).unwrap();
            shares.insert(idx, z);
            pubkeys.insert(idx, keypair.public());
        }

        let sig = aggregate(msg, &kg.group_public, &commitments, &shares, &pubkeys).unwrap();
        (kg.group_public, sig)
    }

    #[test]
    fn threshold_signature_round_trips() {
        let msg = b"(H=1, T=1750000060)";
        let (group_public, sig) = run_ceremony(2, 3, &[1, 2], msg);
        assert!(verify(msg, &sig, &group_public));
    }

    #[test]
    fn signature_does_not_verify_under_wrong_key() {
        let msg = b"(H=1, T=1750000060)";
        let (_group_public, sig) = run_ceremony(2, 3, &[1, 3], msg);
        let other_kg = generate_with_dealer(2, 3, &mut OsRng);
        assert!(!verify(msg, &sig, &other_kg.group_public));
    }

    #[test]
    fn different_quorum_subsets_all_verify() {
        let msg = b"(H=7, T=1750000420)";
        let (group_public_a, sig_a) = run_ceremony(2, 4, &[1, 2], msg);
        let (group_public_b, sig_b) = run_ceremony(2, 4, &[1, 2], msg);
        // Independent keygens: just confirm each subset's own signature verifies.
        assert!(verify(msg, &sig_a, &group_public_a));
        assert!(verify(msg, &sig_b, &group_public_b));
    }

    #[test]
    fn mismatched_share_count_is_rejected() {
        let kg = generate_with_dealer(2, 3, &mut OsRng);
        let msg = b"msg";
        let (_n1, c1) = commit(1, &mut OsRng);
        let shares = BTreeMap::new();
        let pubkeys: BTreeMap<u16, Point> = kg.shares.iter().map(|(i, k)| (*i, k.public())).collect();
        let err = aggregate(msg, &kg.group_public, &[c1], &shares, &pubkeys).unwrap_err();
        assert!(matches!(err, FrostError::MismatchedCommitmentsAndResponses));
    }
}
