//! ROAST (Robust Asynchronous Schnorr Threshold signatures) coordinator
//! (C3): drives concurrent signing sessions over rotating `2f+1` signer
//! subsets, tolerant of up to `f` non-responders.
//!
//! Grounded directly on spec §4.3 — the original C++ port signs with the
//! full signer set and has no ROAST-equivalent coordinator — with the
//! bookkeeping style (named states, small owned structs) following the
//! teacher's `signer.rs` `SigningState`/`run_signing_ceremony` shape.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::errors::{FbftError, FrostError};
use crate::fbft::apply::RoastDriver;
use crate::frost::{self, Signature, SigningCommitment};
use crate::messages::{Message, Payload, SenderRole};
use crate::wallet::{ThresholdWallet, Wallet};

/// A signer's slot in the ready pool: one unused presignature commitment.
#[derive(Clone)]
struct ReadyPresignature {
    commitment: SigningCommitment,
}

/// An in-flight signing session over a fixed signer subset.
pub struct Session {
    pub n: u64,
    pub signers: BTreeSet<u16>,
    combined_presignature: Vec<SigningCommitment>,
    msg_bytes: Vec<u8>,
    shares: BTreeMap<u16, crate::crypto::Scalar>,
}

impl Session {
    pub fn is_final(&self, quorum: usize) -> bool {
        self.shares.len() >= quorum
    }
}

/// Encodes what every signer in a session signs over: `(block-hash, pre_sig,
/// S)` (§4.3 step 2). Both the coordinator (to verify/aggregate) and each
/// signer (to produce its share) derive this independently from the same
/// `ROAST_PRE_SIGNATURE` contents, so no extra wire field is needed.
fn signing_message(block_hash: &[u8], pre_sig: &[SigningCommitment], signers: &BTreeSet<u16>) -> Vec<u8> {
    #[derive(Serialize)]
    struct SigningMessage<'a> {
        block_hash: &'a [u8],
        pre_sig: &'a [SigningCommitment],
        signers: &'a BTreeSet<u16>,
    }
    serde_json::to_vec(&SigningMessage { block_hash, pre_sig, signers }).expect("signing message is always serializable")
}

/// Coordinator state: a pool of ready signers and the sessions in flight.
///
/// `quorum` is `2f+1`, the signer-subset size every session uses.
pub struct Coordinator {
    quorum: usize,
    ready: BTreeMap<u16, ReadyPresignature>,
    sessions: Vec<Session>,
}

impl Coordinator {
    pub fn new(quorum: usize) -> Self {
        Coordinator { quorum, ready: BTreeMap::new(), sessions: Vec::new() }
    }

    /// Registers signer `id`'s freshly published presignature commitment
    /// as ready for a future session.
    pub fn offer_presignature(&mut self, id: u16, commitment: SigningCommitment) {
        self.ready.insert(id, ReadyPresignature { commitment });
    }

    /// If at least `quorum` signers are ready, starts a new session for
    /// sequence `n` over `block_hash`, picking an arbitrary `quorum`-sized
    /// subset. The chosen signers are removed from the ready pool; each
    /// becomes ready again only after replying with its `next_pre_share`
    /// (§4.3 step 3).
    pub fn try_start_session(&mut self, n: u64, block_hash: &[u8]) -> Option<(BTreeSet<u16>, Vec<SigningCommitment>)> {
        if self.ready.len() < self.quorum {
            return None;
        }
        let chosen: BTreeSet<u16> = self.ready.keys().take(self.quorum).copied().collect();
        let combined: Vec<SigningCommitment> = chosen.iter().map(|id| self.ready[id].commitment).collect();
        for id in &chosen {
            self.ready.remove(id);
        }
        let msg_bytes = signing_message(block_hash, &combined, &chosen);
        self.sessions.push(Session {
            n,
            signers: chosen.clone(),
            combined_presignature: combined.clone(),
            msg_bytes,
            shares: BTreeMap::new(),
        });
        Some((chosen, combined))
    }

    /// Records `signer`'s signature share for whichever in-flight session it
    /// belongs to (and hasn't already answered), and makes its
    /// `next_pre_share` ready for a future session. Returns the finalised
    /// signature once `quorum` shares have been collected for that session,
    /// `None` while it is still pending, and `None` for a stray or duplicate
    /// reply that matches no open session — callers should not treat that as
    /// an error, since late ROAST_SIGNATURE_SHAREs for an already-finalised
    /// session are an expected consequence of asynchronous delivery.
    pub fn receive_signature_share_by_sender(
        &mut self,
        sender: u16,
        sig_share: crate::crypto::Scalar,
        next_pre_share: SigningCommitment,
        group_public: &crate::crypto::Point,
        signer_public_keys: &BTreeMap<u16, crate::crypto::Point>,
    ) -> Result<Option<(u64, Signature)>, FrostError> {
        let Some(pos) = self.sessions.iter().position(|s| s.signers.contains(&sender) && !s.shares.contains_key(&sender))
        else {
            return Ok(None);
        };

        self.offer_presignature(sender, next_pre_share);
        self.sessions[pos].shares.insert(sender, sig_share);

        if !self.sessions[pos].is_final(self.quorum) {
            return Ok(None);
        }

        let session = self.sessions.remove(pos);
        let sig = frost::aggregate(
            &session.msg_bytes,
            group_public,
            &session.combined_presignature,
            &session.shares,
            signer_public_keys,
        )?;
        Ok(Some((session.n, sig)))
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn sessions_in_flight(&self) -> usize {
        self.sessions.len()
    }
}

/// Drives ROAST sessions for a replica running the threshold wallet
/// backend. Every replica plays both roles §4.3 describes: coordinator,
/// when its own quorum of COMMITs is ready to start a session, and signer,
/// when an inbound `ROAST_PRE_SIGNATURE` names it as part of `S`.
pub struct ThresholdRoastDriver<W: ThresholdWallet> {
    coordinator: Coordinator,
    wallet: Arc<Mutex<W>>,
    own_id: u32,
    group_public: crate::crypto::Point,
    signer_public_keys: BTreeMap<u16, crate::crypto::Point>,
}

impl<W: ThresholdWallet> ThresholdRoastDriver<W> {
    pub fn new(
        quorum: usize,
        wallet: Arc<Mutex<W>>,
        own_id: u32,
        group_public: crate::crypto::Point,
        signer_public_keys: BTreeMap<u16, crate::crypto::Point>,
    ) -> Self {
        ThresholdRoastDriver { coordinator: Coordinator::new(quorum), wallet, own_id, group_public, signer_public_keys }
    }
}

impl<W: ThresholdWallet> RoastDriver for ThresholdRoastDriver<W> {
    fn init(
        &mut self,
        n: u64,
        _req_digest: &str,
        block_hash: &[u8],
        raw_presignatures: Vec<(u32, Vec<u8>)>,
    ) -> (Vec<Message>, Option<Signature>) {
        // `raw_presignatures` is keyed by replica id (§3: COMMIT's sender);
        // the coordinator's ready pool and the FROST signer-index space are
        // offset by one (§3: "a signer index ... is i+1").
        for (sender, bytes) in raw_presignatures {
            if let Ok(commitment) = serde_json::from_slice::<SigningCommitment>(&bytes) {
                self.coordinator.offer_presignature(sender as u16 + 1, commitment);
            }
        }

        let Some((signers, pre_sig)) = self.coordinator.try_start_session(n, block_hash) else {
            return (Vec::new(), None);
        };
        let pre_signature = serde_json::to_vec(&pre_sig).unwrap_or_default();
        let outbound = signers
            .iter()
            .map(|&s| {
                let payload = Payload::RoastPreSignature { signers: signers.clone(), pre_signature: pre_signature.clone() };
                Message::unsigned(SenderRole::Replica, self.own_id, payload).addressed_to((s - 1) as u32)
            })
            .collect();
        (outbound, None)
    }

    fn receive_pre_signature(&mut self, msg: &Message, block_hash: &[u8]) -> Result<Option<Message>, FbftError> {
        let Payload::RoastPreSignature { signers, pre_signature } = &msg.payload else {
            return Ok(None);
        };
        let pre_sig: Vec<SigningCommitment> = serde_json::from_slice(pre_signature)
            .map_err(|e| FbftError::Message(crate::errors::MessageError::Codec(e)))?;
        let msg_bytes = signing_message(block_hash, &pre_sig, signers);

        let mut wallet = self.wallet.lock().expect("wallet mutex poisoned");
        let sig_share = wallet.get_signature_share(signers, &pre_sig, &msg_bytes)?;
        let next_pre_share = wallet.get_pre_signature_share();
        drop(wallet);

        let payload = Payload::RoastSignatureShare {
            sig_share: sig_share.serialize().to_vec(),
            next_pre_share: serde_json::to_vec(&next_pre_share).unwrap_or_default(),
        };
        let reply = Message::unsigned(SenderRole::Replica, self.own_id, payload).addressed_to(msg.sender_id);
        Ok(Some(reply))
    }

    fn receive_signature_share(&mut self, msg: &Message) -> Result<Option<(u64, Signature)>, FbftError> {
        let Payload::RoastSignatureShare { sig_share, next_pre_share } = &msg.payload else {
            return Ok(None);
        };
        let sig_share_bytes: [u8; 32] = sig_share.as_slice().try_into().map_err(|_| FbftError::SignatureInvalid)?;
        let sig_share = crate::crypto::Scalar::from_canonical_bytes(&sig_share_bytes).map_err(|_| FbftError::SignatureInvalid)?;
        let next_commitment: SigningCommitment = serde_json::from_slice(next_pre_share)
            .map_err(|e| FbftError::Message(crate::errors::MessageError::Codec(e)))?;
        // `msg.sender_id` is the replying signer's replica id; the
        // coordinator's bookkeeping runs in the FROST signer-index space.
        let sender = u16::try_from(msg.sender_id).map_err(|_| FbftError::SignatureInvalid)? + 1;

        self.coordinator
            .receive_signature_share_by_sender(sender, sig_share, next_commitment, &self.group_public, &self.signer_public_keys)
            .map_err(|e| FbftError::Wallet(crate::errors::WalletError::Frost(e)))
    }
}

/// Stands in for ROAST when the cluster runs the naïve wallet backend,
/// whose COMMIT `pre_signature` already *is* a full per-replica signature
/// rather than a FROST nonce commitment (§4.7's two-backend split). Raw
/// per-replica ECDSA/Schnorr signatures are not a FROST secret-sharing and
/// cannot be summed into a single BIP-340 signature the way real
/// presignature shares can; combining them into a signet solution is a
/// PSBT multisig concern owned by the out-of-scope blockchain adapter
/// (§1). This driver therefore never finalises: it reports the ready pool
/// reaching quorum and leaves actual block finalization to that adapter.
pub struct NaiveSigningDriver {
    quorum: usize,
}

impl NaiveSigningDriver {
    pub fn new(quorum: usize) -> Self {
        NaiveSigningDriver { quorum }
    }
}

impl RoastDriver for NaiveSigningDriver {
    fn init(
        &mut self,
        n: u64,
        _req_digest: &str,
        _block_hash: &[u8],
        raw_presignatures: Vec<(u32, Vec<u8>)>,
    ) -> (Vec<Message>, Option<Signature>) {
        if raw_presignatures.len() >= self.quorum {
            tracing::warn!(
                n,
                ready = raw_presignatures.len(),
                "naive backend reached commit quorum but cannot finalize a signet solution locally; PSBT combination at the blockchain adapter is required"
            );
        }
        (Vec::new(), None)
    }

    fn receive_pre_signature(&mut self, _msg: &Message, _block_hash: &[u8]) -> Result<Option<Message>, FbftError> {
        Ok(None)
    }

    fn receive_signature_share(&mut self, _msg: &Message) -> Result<Option<(u64, Signature)>, FbftError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frost::{commit, keys::generate_with_dealer, sign};
    use rand::rngs::OsRng;

    #[test]
    fn session_finalises_once_quorum_shares_arrive() {
        let kg = generate_with_dealer(3, 4, &mut OsRng);
        let quorum = 3; // 2f+1 for N=4, f=1
        let mut coordinator = Coordinator::new(quorum);

        let mut nonces = BTreeMap::new();
        for id in [1u16, 2, 3] {
            let (nonce, commitment) = commit(id, &mut OsRng);
            nonces.insert(id, nonce);
            coordinator.offer_presignature(id, commitment);
        }

        let block_hash = b"block-hash-fixture".to_vec();
        let (signers, commitments) = coordinator.try_start_session(1, &block_hash).expect("quorum is ready");
        assert_eq!(signers.len(), quorum);
        let msg = signing_message(&block_hash, &commitments, &signers);

        let pubkeys: BTreeMap<u16, crate::crypto::Point> =
            kg.shares.iter().map(|(i, k)| (*i, k.public())).collect();

        let mut last = None;
        for (idx, &id) in signers.iter().enumerate() {
            let keypair = &kg.shares[&id];
            let z = sign(keypair, nonces[&id], &commitments, &msg).unwrap();
            let (next_nonce, next_commitment) = commit(id, &mut OsRng);
            nonces.insert(id, next_nonce);
            let is_last = idx == signers.len() - 1;
            let result = coordinator
                .receive_signature_share_by_sender(id, z, next_commitment, &kg.group_public, &pubkeys)
                .unwrap();
            if is_last {
                last = result;
            } else {
                assert!(result.is_none());
            }
        }

        let (n, sig) = last.expect("session finalises on the last share");
        assert_eq!(n, 1);
        assert!(frost::verify(&msg, &sig, &kg.group_public));
    }

    #[test]
    fn minority_unresponsive_does_not_block_a_second_session() {
        // N=4, f=1, quorum=3: two sessions of {0,1} and {0,2}-style subsets
        // can both be started as long as enough distinct signers are ready
        // across rounds (S5).
        let quorum = 2; // smaller cluster for this unit test
        let mut coordinator = Coordinator::new(quorum);
        for id in [0u16, 1] {
            let (_nonce, commitment) = commit(id, &mut OsRng);
            coordinator.offer_presignature(id, commitment);
        }
        assert!(coordinator.try_start_session(1, b"block-a").is_some());
        assert_eq!(coordinator.ready_count(), 0);

        // signer 1 never responds; signer 0 and a fresh signer 2 become ready.
        let (_nonce, commitment) = commit(2, &mut OsRng);
        coordinator.offer_presignature(0, commitment);
        let (_nonce, commitment) = commit(2, &mut OsRng);
        coordinator.offer_presignature(2, commitment);
        assert!(coordinator.try_start_session(2, b"block-b").is_some());
        assert_eq!(coordinator.sessions_in_flight(), 2);
    }

    #[test]
    fn stray_signature_share_is_ignored_not_panicked() {
        let kg = generate_with_dealer(2, 3, &mut OsRng);
        let mut coordinator = Coordinator::new(2);
        let pubkeys: BTreeMap<u16, crate::crypto::Point> =
            kg.shares.iter().map(|(i, k)| (*i, k.public())).collect();
        let (_nonce, commitment) = commit(9, &mut OsRng);

        // No session was ever started, so a reply from signer 9 matches
        // nothing; this must return `Ok(None)`, never panic.
        let result = coordinator.receive_signature_share_by_sender(
            9,
            crate::crypto::Scalar::ZERO,
            commitment,
            &kg.group_public,
            &pubkeys,
        );
        assert!(matches!(result, Ok(None)));
    }

    mod driver_tests {
        use super::*;
        use crate::errors::WalletError;
        use crate::frost::keys::{generate_with_dealer, Keypair};
        use crate::frost::NoncePair;
        use crate::wallet::BlockSignature;
        use rand::rngs::OsRng;
        use std::sync::{Arc, Mutex};

        struct MockWallet {
            keypair: Keypair,
            live_nonce: Option<NoncePair>,
        }

        impl Wallet for MockWallet {
            fn append_signature(&self, _msg: &Message) -> Result<Vec<u8>, WalletError> {
                Ok(Vec::new())
            }

            fn verify_signature(&self, _msg: &Message) -> bool {
                true
            }

            fn finalize_block(
                &self,
                block: bitcoin::Block,
                _aux: &[u8],
                _shares: &[BlockSignature],
            ) -> Result<bitcoin::Block, WalletError> {
                Ok(block)
            }
        }

        impl ThresholdWallet for MockWallet {
            fn get_pre_signature_share(&mut self) -> SigningCommitment {
                let (nonce, commitment) = commit(self.keypair.index, &mut OsRng);
                self.live_nonce = Some(nonce);
                commitment
            }

            fn get_signature_share(
                &mut self,
                _signers: &BTreeSet<u16>,
                pre_sig: &[SigningCommitment],
                msg: &[u8],
            ) -> Result<crate::crypto::Scalar, WalletError> {
                let nonce = self.live_nonce.take().ok_or(WalletError::NonceMissing)?;
                frost::sign(&self.keypair, nonce, pre_sig, msg).map_err(WalletError::Frost)
            }
        }

        #[test]
        fn threshold_driver_round_trip_finalises_a_signature() {
            // Replica ids are 0-based (0..=3); FROST signer indices are the
            // replica id plus one (1..=4), per the conversion `init`/
            // `receive_signature_share` apply at the wire boundary.
            let kg = generate_with_dealer(3, 4, &mut OsRng);
            let quorum = 3;
            let signer_public_keys: BTreeMap<u16, crate::crypto::Point> =
                kg.shares.iter().map(|(i, k)| (*i, k.public())).collect();

            let mut coordinator_driver = ThresholdRoastDriver::new(
                quorum,
                Arc::new(Mutex::new(MockWallet { keypair: kg.shares[&1].clone(), live_nonce: None })),
                0,
                kg.group_public,
                signer_public_keys.clone(),
            );

            // replica id -> wallet, keyed with the matching signer index's keypair.
            let mut signer_wallets: BTreeMap<u32, Arc<Mutex<MockWallet>>> = BTreeMap::new();
            for replica_id in [0u32, 1, 2] {
                let signer_index = replica_id as u16 + 1;
                signer_wallets.insert(
                    replica_id,
                    Arc::new(Mutex::new(MockWallet { keypair: kg.shares[&signer_index].clone(), live_nonce: None })),
                );
            }

            let mut raw = Vec::new();
            for (&replica_id, wallet) in &signer_wallets {
                let commitment = wallet.lock().unwrap().get_pre_signature_share();
                raw.push((replica_id, serde_json::to_vec(&commitment).unwrap()));
            }

            let block_hash = b"block-hash-fixture".to_vec();
            let (outbound, finalized) = coordinator_driver.init(1, "(H=1, T=60)", &block_hash, raw);
            assert!(finalized.is_none());
            assert_eq!(outbound.len(), quorum);

            let (signers, pre_sig) = match &outbound[0].payload {
                Payload::RoastPreSignature { signers, pre_signature } => {
                    (signers.clone(), serde_json::from_slice::<Vec<SigningCommitment>>(pre_signature).unwrap())
                }
                _ => panic!("expected ROAST_PRE_SIGNATURE"),
            };
            let expected_msg = signing_message(&block_hash, &pre_sig, &signers);

            let mut last = None;
            for pre_signature_msg in outbound {
                let replica_id = pre_signature_msg.to.expect("pre-signature is unicast");
                let wallet = signer_wallets[&replica_id].clone();
                let mut signer_driver =
                    ThresholdRoastDriver::new(quorum, wallet, replica_id, kg.group_public, signer_public_keys.clone());
                let reply = signer_driver.receive_pre_signature(&pre_signature_msg, &block_hash).unwrap().unwrap();
                if let Some(result) = coordinator_driver.receive_signature_share(&reply).unwrap() {
                    last = Some(result);
                }
            }

            let (n, sig) = last.expect("session finalises once every signer has replied");
            assert_eq!(n, 1);
            assert!(frost::verify(&expected_msg, &sig, &kg.group_public));
        }
    }
}
