//! ROAST/FROST wallet backend: threshold Schnorr signing over the group
//! key, the signet chain's actual acceptance path.
//!
//! Grounded on the teacher's `src/signer.rs` (`FrostSigner`,
//! `SigningState`) restructured around this crate's own [`crate::frost`]
//! implementation instead of `frost_secp256k1_tr`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bitcoin::Block;

use crate::blockchain::RpcBlockchain;
use crate::crypto::Scalar;
use crate::errors::{FrostError, WalletError};
use crate::frost::{self, Keypair, NoncePair, SigningCommitment};
use crate::messages::Message;
use crate::wallet::{BlockSignature, ThresholdWallet, Wallet};

/// A message-signing identity for [`Wallet::append_signature`] /
/// [`Wallet::verify_signature`], independent of the FROST group key.
pub trait MessageIdentity {
    fn sign(&self, digest_hex: &str) -> Vec<u8>;
    fn verify(&self, sender_id: u32, digest_hex: &str, signature: &[u8]) -> bool;
}

/// Owns this replica's FROST key share and the single live nonce pair, if
/// any. Reuse after [`ThresholdWallet::get_signature_share`] consumes the
/// nonce is a hard error (§3 "Keypair lifecycle", §8 invariant 5).
pub struct RoastWallet<I: MessageIdentity> {
    keypair: Keypair,
    group_public: crate::crypto::Point,
    signer_public_keys: BTreeMap<u16, crate::crypto::Point>,
    live_nonce: Option<NoncePair>,
    identity: I,
}

impl<I: MessageIdentity> RoastWallet<I> {
    pub fn new(
        keypair: Keypair,
        group_public: crate::crypto::Point,
        signer_public_keys: BTreeMap<u16, crate::crypto::Point>,
        identity: I,
    ) -> Self {
        RoastWallet { keypair, group_public, signer_public_keys, live_nonce: None, identity }
    }
}

impl<I: MessageIdentity> Wallet for RoastWallet<I> {
    fn append_signature(&self, msg: &Message) -> Result<Vec<u8>, WalletError> {
        let digest_hex = String::from_utf8(msg.sign_payload()).expect("digest hex is valid utf8");
        Ok(self.identity.sign(&digest_hex))
    }

    fn verify_signature(&self, msg: &Message) -> bool {
        let digest_hex = String::from_utf8(msg.sign_payload()).expect("digest hex is valid utf8");
        self.identity.verify(msg.sender_id, &digest_hex, &msg.signature)
    }

    fn finalize_block(&self, block: Block, _aux: &[u8], shares: &[BlockSignature]) -> Result<Block, WalletError> {
        let share = shares.first().ok_or(WalletError::RequestMissing)?;
        let mut solution = [0u8; 64];
        let n = share.signature.len().min(64);
        solution[..n].copy_from_slice(&share.signature[..n]);
        RpcBlockchain::insert_signet_solution(block, &solution).map_err(WalletError::Blockchain)
    }

    fn pre_signature_commitment(&mut self) -> Option<SigningCommitment> {
        Some(ThresholdWallet::get_pre_signature_share(self))
    }
}

impl<I: MessageIdentity> ThresholdWallet for RoastWallet<I> {
    fn get_pre_signature_share(&mut self) -> SigningCommitment {
        let mut rng = rand::rngs::OsRng;
        let (nonce, commitment) = frost::commit(self.keypair.index, &mut rng);
        self.live_nonce = Some(nonce);
        commitment
    }

    fn get_signature_share(
        &mut self,
        _signers: &std::collections::BTreeSet<u16>,
        pre_sig: &[SigningCommitment],
        msg: &[u8],
    ) -> Result<Scalar, WalletError> {
        let nonce = self.live_nonce.take().ok_or(WalletError::NonceMissing)?;
        frost::sign(&self.keypair, nonce, pre_sig, msg)
            .map_err(|e| match e {
                FrostError::Crypto(c) => WalletError::Frost(FrostError::Crypto(c)),
                other => WalletError::Frost(other),
            })
    }
}

impl<I: MessageIdentity> RoastWallet<I> {
    pub fn group_public(&self) -> crate::crypto::Point {
        self.group_public
    }

    pub fn signer_public_keys(&self) -> &BTreeMap<u16, crate::crypto::Point> {
        &self.signer_public_keys
    }
}

/// Lets a single `RoastWallet` be shared between the replica driver (which
/// needs a `Box<dyn Wallet>`) and the ROAST coordinator (which needs an
/// `Arc<Mutex<dyn ThresholdWallet>>`) without duplicating the live-nonce
/// state: both sides lock the same mutex, so `get_signature_share`'s
/// nonce-consumption (§3 "Keypair lifecycle") is observed consistently
/// regardless of which side calls it.
impl<I: MessageIdentity + Send> Wallet for Arc<Mutex<RoastWallet<I>>> {
    fn append_signature(&self, msg: &Message) -> Result<Vec<u8>, WalletError> {
        self.lock().expect("wallet mutex poisoned").append_signature(msg)
    }

    fn verify_signature(&self, msg: &Message) -> bool {
        self.lock().expect("wallet mutex poisoned").verify_signature(msg)
    }

    fn finalize_block(&self, block: Block, aux: &[u8], shares: &[BlockSignature]) -> Result<Block, WalletError> {
        self.lock().expect("wallet mutex poisoned").finalize_block(block, aux, shares)
    }

    fn pre_signature_commitment(&mut self) -> Option<SigningCommitment> {
        self.lock().expect("wallet mutex poisoned").pre_signature_commitment()
    }

    fn commit_payload(&mut self, block: &Block) -> Vec<u8> {
        self.lock().expect("wallet mutex poisoned").commit_payload(block)
    }
}
