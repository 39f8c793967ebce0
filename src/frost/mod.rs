//! FROST threshold Schnorr signing (C2): trusted-dealer key generation and
//! the two-round signing protocol, built on [`crate::crypto`].

pub mod keys;
pub mod signer;

pub use keys::{generate_with_dealer, DealerKeyGen, Keypair};
pub use signer::{aggregate, commit, lagrange_coefficient, sign, verify, NoncePair, Signature, SigningCommitment};
