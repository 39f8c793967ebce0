//! Tagged hashing per BIP-340 and the FROST-secp256k1-SHA256-v10 ciphersuite.

use sha2::{Digest, Sha256};

/// FROST ciphersuite context string (draft-irtf-cfrg-frost rev. 10).
pub const FROST_CONTEXT_STRING: &str = "FROST-secp256k1-SHA256-v10";

/// BIP-340 tagged hash: `SHA256(SHA256(tag) || SHA256(tag) || msg)`.
///
/// Used for the Schnorr challenge `e = H(R.x || P.x || m)` with
/// `tag = "BIP0340/challenge"`.
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// Plain `SHA256(FROST_CONTEXT_STRING || suffix || msg)`, used for the
/// FROST `H1`/`H3`/`H4`/`H5` hashes (the binding factor, nonce, per-message
/// and per-commitment-list hashes).
pub fn frost_hash(suffix: &str, msg: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(FROST_CONTEXT_STRING.as_bytes());
    hasher.update(suffix.as_bytes());
    hasher.update(msg);
    hasher.finalize().into()
}

/// The binding-factor hash `H1`.
pub fn h1_rho(msg: &[u8]) -> [u8; 32] {
    frost_hash("rho", msg)
}

/// The per-message hash `H4`.
pub fn h4_msg(msg: &[u8]) -> [u8; 32] {
    frost_hash("msg", msg)
}

/// The commitment-list hash `H5`.
pub fn h5_com(msg: &[u8]) -> [u8; 32] {
    frost_hash("com", msg)
}

/// Plain SHA-256, used where no domain separation is required.
pub fn sha256(msg: &[u8]) -> [u8; 32] {
    Sha256::digest(msg).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_hash_is_deterministic() {
        let a = tagged_hash("BIP0340/challenge", b"hello");
        let b = tagged_hash("BIP0340/challenge", b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_suffixes_diverge() {
        let rho = frost_hash("rho", b"msg");
        let chal = frost_hash("chal", b"msg");
        assert_ne!(rho, chal);
    }
}
