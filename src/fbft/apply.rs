//! `apply(action, state)` (§9): the single function that turns an
//! [`Action`] into the next [`State`] plus outbound messages, replacing the
//! reference implementation's per-action `effect_*` Prolog predicates with
//! plain Rust.

use tracing::{instrument, warn};

use crate::blockchain::Blockchain;
use crate::errors::FbftError;
use crate::frost::Signature;
use crate::messages::codec::verify_new_view;
use crate::messages::{Message, Payload, PrePreparedEntry, SenderRole, ViewChangeRecord};
use crate::wallet::{BlockSignature, Wallet};

use super::actions::Action;
use super::state::{State, ViewChangeTimer};

/// The ROAST coordinator's half of the FBFT↔ROAST seam (C3 owns the
/// session bookkeeping; FBFT only needs to kick sessions off and learn
/// when one finalises).
pub trait RoastDriver {
    /// A quorum of COMMITs has been collected for `n`, each carrying a raw
    /// `pre_signature` payload (opaque to FBFT: a serialized
    /// [`SigningCommitment`] for a threshold backend, or a raw per-replica
    /// signature for the naïve backend); start (or continue) signing
    /// `req_digest`'s block (hashing to `block_hash`) over that ready pool.
    /// Returns any outbound messages to send plus, if this backend can
    /// finalise without a network round-trip, the finalised signature.
    fn init(
        &mut self,
        n: u64,
        req_digest: &str,
        block_hash: &[u8],
        raw_presignatures: Vec<(u32, Vec<u8>)>,
    ) -> (Vec<Message>, Option<Signature>);

    /// Handles an inbound `ROAST_PRE_SIGNATURE` for the block hashing to
    /// `block_hash`, returning the `ROAST_SIGNATURE_SHARE` reply to send
    /// back to the coordinator, if any.
    fn receive_pre_signature(&mut self, msg: &Message, block_hash: &[u8]) -> Result<Option<Message>, FbftError>;

    /// Handles an inbound `ROAST_SIGNATURE_SHARE` at the coordinator,
    /// returning the finalised signature once the session completes.
    fn receive_signature_share(&mut self, msg: &Message) -> Result<Option<(u64, Signature)>, FbftError>;
}

/// Hashes the block this replica accepted (or proposed) at `(v, n)`, the
/// message ROAST signs over (§4.3 step 2: "(block-hash, pre_sig, S)").
/// Returns an empty vector if no PRE-PREPARE is on file yet.
fn block_hash_at(state: &State, v: u64, n: u64) -> Vec<u8> {
    use bitcoin::hashes::Hash;
    state
        .pre_prepares
        .get(&(v, n))
        .and_then(|pp| match &pp.payload {
            Payload::PrePrepare { proposed_block, .. } => {
                bitcoin::consensus::deserialize::<bitcoin::Block>(proposed_block).ok()
            }
            _ => None,
        })
        .map(|block| block.block_hash().to_byte_array().to_vec())
        .unwrap_or_default()
}

#[instrument(skip(state, wallet, blockchain, roast), fields(replica = state.params.id))]
pub fn apply(
    state: &mut State,
    action: Action,
    wallet: &mut dyn Wallet,
    blockchain: &dyn Blockchain,
    roast: &mut dyn RoastDriver,
) -> Result<(), FbftError> {
    match action {
        Action::ReceiveRequest(req) => {
            state.requests.insert(req.digest(), req);
            state.last_req = state.last_req.max(req.timestamp);
            if state.view_change_timer.is_none() && req.height() == state.h + 1 {
                state.view_change_timer = Some(ViewChangeTimer { started_at: state.synthetic_time, k: 0 });
            }
        }

        Action::ReceiveBlock(msg) => {
            if let Payload::Block { height, .. } = msg.payload {
                state.advance_checkpoint(height);
            }
        }

        Action::ReceivePrePrepare(msg) => {
            let (v, n, req_digest, proposed_block) = match &msg.payload {
                Payload::PrePrepare { v, n, req_digest, proposed_block } => {
                    (*v, *n, req_digest.clone(), proposed_block.clone())
                }
                _ => return Ok(()),
            };
            let block: bitcoin::Block =
                bitcoin::consensus::deserialize(&proposed_block).map_err(|_| FbftError::BlockInvalid)?;
            let request = *state.requests.get(&req_digest).ok_or(FbftError::RequestMissing)?;

            if !blockchain.test_block_validity(n, &block, false)? {
                return Err(FbftError::BlockInvalid);
            }
            if block.header.time != request.timestamp {
                return Err(FbftError::BlockInvalid);
            }
            let max_future = (state.params.target_block_time / 10.0) as u32;
            if request.timestamp > state.synthetic_time.saturating_add(max_future) {
                return Err(FbftError::BlockInvalid);
            }

            state.pre_prepares.insert((v, n), msg);
        }

        Action::ReceivePrepare(msg) => {
            if let Payload::Prepare { v, n, .. } = &msg.payload {
                state.prepares.entry((*v, *n)).or_default().insert(msg.sender_id, msg.clone());
            }
        }

        Action::ReceiveCommit(msg) => {
            if let Payload::Commit { v, n, .. } = &msg.payload {
                state.commits.entry((*v, *n)).or_default().insert(msg.sender_id, msg.clone());
            }
        }

        Action::ReceiveViewChange(msg) => {
            if let Payload::ViewChange { v, .. } = &msg.payload {
                state.view_changes.entry(*v).or_default().insert(msg.sender_id, msg.clone());
            }
        }

        Action::ReceiveNewView(msg) => {
            if let Payload::NewView { v, .. } = &msg.payload {
                state.new_views.insert(*v, msg);
            }
        }

        Action::RoastReceivePreSignature(msg) => {
            // At most one block is ever in flight (§9, Open Question 2),
            // so the sequence a ROAST_PRE_SIGNATURE refers to — absent
            // from its own payload — is unambiguously h+1.
            let n = state.h + 1;
            let block_hash = block_hash_at(state, state.view, n);
            if let Some(reply) = roast.receive_pre_signature(&msg, &block_hash)? {
                state.out_buffer.push(reply);
            }
        }

        Action::RoastReceiveSignatureShare(msg) => {
            if let Some((n, sig)) = roast.receive_signature_share(&msg)? {
                state.finalized_signatures.insert(n, sig);
            }
        }

        Action::SendPrePrepare { v, n, req_digest } => {
            let request = *state.requests.get(&req_digest).ok_or(FbftError::RequestMissing)?;
            let block = blockchain.generate_block(request.timestamp)?;
            let proposed_block = bitcoin::consensus::serialize(&block);
            let payload = Payload::PrePrepare { v, n, req_digest: req_digest.clone(), proposed_block };
            let msg = sign_and_send(state, wallet, payload)?;
            state.pre_prepares.insert((v, n), msg);
        }

        Action::SendPrepare { v, n, req_digest } => {
            let payload = Payload::Prepare { v, n, req_digest };
            let msg = sign_and_send(state, wallet, payload)?;
            state.prepares.entry((v, n)).or_default().insert(state.params.id, msg);
        }

        Action::SendCommit { v, n, req_digest: _ } => {
            let pp = state.pre_prepares.get(&(v, n)).ok_or(FbftError::RequestMissing)?;
            let block: bitcoin::Block = match &pp.payload {
                Payload::PrePrepare { proposed_block, .. } => {
                    bitcoin::consensus::deserialize(proposed_block).map_err(|_| FbftError::BlockInvalid)?
                }
                _ => return Ok(()),
            };
            let pre_signature = wallet.commit_payload(&block);
            let payload = Payload::Commit { v, n, pre_signature };
            let msg = sign_and_send(state, wallet, payload)?;
            state.commits.entry((v, n)).or_default().insert(state.params.id, msg);
        }

        Action::RoastInit { n } => {
            if let Some((digest, _)) = state.request_for_seq(n) {
                let digest = digest.clone();
                let block_hash = block_hash_at(state, state.view, n);
                let raw: Vec<(u32, Vec<u8>)> = state
                    .commits
                    .get(&(state.view, n))
                    .into_iter()
                    .flat_map(|by_sender| by_sender.iter())
                    .filter_map(|(&sender, msg)| match &msg.payload {
                        Payload::Commit { pre_signature, .. } if !pre_signature.is_empty() => {
                            Some((sender, pre_signature.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                let (outbound, finalized) = roast.init(n, &digest, &block_hash, raw);
                state.out_buffer.extend(outbound);
                if let Some(sig) = finalized {
                    state.finalized_signatures.insert(n, sig);
                }
            }
        }

        Action::Execute { v: _, n } => {
            let request_timestamp = state.request_for_seq(n).ok_or(FbftError::RequestMissing)?.1.timestamp;
            state.last_rep = state.last_rep.max(request_timestamp);
            let proposed_block = {
                let pp = state.pre_prepares.get(&(state.view, n)).ok_or(FbftError::RequestMissing)?;
                match &pp.payload {
                    Payload::PrePrepare { proposed_block, .. } => proposed_block.clone(),
                    _ => return Ok(()),
                }
            };
            let block: bitcoin::Block =
                bitcoin::consensus::deserialize(&proposed_block).map_err(|_| FbftError::BlockInvalid)?;
            let signature = *state.finalized_signatures.get(&n).ok_or(FbftError::SignatureInvalid)?;
            let share = BlockSignature { signer_id: state.params.id, signature: signature.to_bytes().to_vec() };
            let signed_block = wallet.finalize_block(block, &[], std::slice::from_ref(&share))?;
            blockchain.submit_block(n, &signed_block)?;
            state.executed.insert(n);
        }

        Action::SendViewChange { new_view } => {
            let payload = Payload::ViewChange {
                v: new_view,
                hi: state.h,
                checkpoint: format!("h={}", state.h),
                p: state.prepared_entries(),
                q: state.pre_prepared_entries(),
            };
            let msg = sign_and_send(state, wallet, payload)?;
            state.view_changes.entry(new_view).or_default().insert(state.params.id, msg);
            let attempts = state.view_change_timer.map(|t| t.k + 1).unwrap_or(1);
            state.view_change_timer = Some(ViewChangeTimer { started_at: state.synthetic_time, k: attempts });
        }

        Action::SendNewView { v } => {
            let nu = collect_view_change_records(state, v);
            let chi = reissue_pre_prepares(state, v);
            let payload = Payload::NewView { v, nu, chi };
            let msg = sign_and_send(state, wallet, payload)?;
            state.new_views.insert(v, msg);
        }

        Action::ProcessNewView { v } => {
            install_new_view(state, v, &*wallet);
        }

        Action::RecoverView { v } => {
            // A NEW_VIEW for a view further ahead than v+1 was observed:
            // this replica missed intermediate view changes. Jump straight
            // to it rather than replaying every skipped view.
            install_new_view(state, v, &*wallet);
        }
    }

    Ok(())
}

fn sign_and_send(state: &mut State, wallet: &dyn Wallet, payload: Payload) -> Result<Message, FbftError> {
    let mut msg = Message::unsigned(SenderRole::Replica, state.params.id, payload);
    msg.signature = wallet.append_signature(&msg)?;
    state.out_buffer.push(msg.clone());
    Ok(msg)
}

fn collect_view_change_records(state: &State, v: u64) -> Vec<crate::messages::ViewChangeRecord> {
    state
        .view_changes
        .get(&v)
        .into_iter()
        .flat_map(|by_sender| by_sender.values())
        .filter_map(|msg| {
            let Payload::ViewChange { v, hi, checkpoint, p, q } = &msg.payload else { return None };
            Some(crate::messages::ViewChangeRecord {
                sender_id: msg.sender_id,
                digest: msg.digest(),
                v: *v,
                hi: *hi,
                checkpoint: checkpoint.clone(),
                p: p.clone(),
                q: q.clone(),
                signature: msg.signature.clone(),
            })
        })
        .collect()
}

/// Derives the unique `Chi` consistent with a set of VIEW_CHANGE records
/// (§4.5): one re-issued PRE-PREPARE per sequence number with a
/// P-certificate among `records`' `Q` entries, plus a synthetic null
/// PRE-PREPARE for `next_seq` if nothing certified it. Used both to build
/// `Chi` when sending a NEW_VIEW (from this replica's own collected
/// VIEW_CHANGEs) and to re-derive the expected `Chi` when installing one
/// received from the primary (from the NEW_VIEW's embedded `Nu`) — the two
/// must agree, since `Chi` is a pure function of `Nu`.
fn derive_chi(records: &[ViewChangeRecord], v: u64, next_seq: u64) -> Vec<PrePreparedEntry> {
    let mut by_seq: std::collections::BTreeMap<u64, PrePreparedEntry> = std::collections::BTreeMap::new();
    for record in records {
        for entry in &record.q {
            by_seq.entry(entry.n).or_insert_with(|| entry.clone());
        }
    }
    by_seq.entry(next_seq).or_insert_with(|| PrePreparedEntry {
        n: next_seq,
        req_digest: String::from("NULL"),
        proposed_block: Vec::new(),
        v,
    });
    by_seq.into_values().collect()
}

/// Re-issues a PRE-PREPARE for every sequence number with a P-certificate
/// across the collected VIEW_CHANGEs; gaps get a PRE-PREPARE for a
/// synthetic null request (§4.5).
fn reissue_pre_prepares(state: &State, v: u64) -> Vec<PrePreparedEntry> {
    let records = collect_view_change_records(state, v);
    derive_chi(&records, v, state.h + 1)
}

/// Installs a received NEW_VIEW (§4.5): a non-primary "accept[s] NEW_VIEW
/// iff every embedded VIEW_CHANGE verifies AND the derived `Chi` is the
/// unique set consistent with `Nu`". A Byzantine primary that ships a
/// `chi` inconsistent with its own `nu` — or a forged/unsigned embedded
/// VIEW_CHANGE — is rejected outright and the view does not advance
/// (§8 invariant 2).
fn install_new_view(state: &mut State, v: u64, wallet: &dyn Wallet) {
    let Some(nv) = state.new_views.get(&v).cloned() else {
        return;
    };
    if let Err(err) = verify_new_view(&nv, wallet) {
        warn!(replica = state.params.id, v, error = %err, "rejecting NEW_VIEW: embedded VIEW_CHANGE failed to verify");
        state.new_views.remove(&v);
        return;
    }
    let Payload::NewView { nu, chi, .. } = &nv.payload else {
        return;
    };
    let expected_chi = derive_chi(nu, v, state.h + 1);
    if chi != &expected_chi {
        warn!(replica = state.params.id, v, "rejecting NEW_VIEW: Chi is not the set consistent with Nu");
        state.new_views.remove(&v);
        return;
    }

    state.view = v;
    state.view_change_timer = None;
    for entry in chi {
        if entry.req_digest == "NULL" {
            continue;
        }
        let payload = Payload::PrePrepare {
            v,
            n: entry.n,
            req_digest: entry.req_digest.clone(),
            proposed_block: entry.proposed_block.clone(),
        };
        let msg = Message::unsigned(SenderRole::Replica, nv.sender_id, payload);
        state.pre_prepares.insert((v, entry.n), msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fbft::state::ReplicaParams;
    use crate::wallet::BlockSignature;
    use bitcoin::hashes::Hash;

    fn params() -> ReplicaParams {
        ReplicaParams { id: 0, n: 4, genesis_block_timestamp: 0, target_block_time: 60.0 }
    }

    struct StubWallet;
    impl Wallet for StubWallet {
        fn append_signature(&self, _msg: &Message) -> Result<Vec<u8>, crate::errors::WalletError> {
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
        ) -> Result<bitcoin::Block, crate::errors::WalletError> {
            Ok(block)
        }
    }

    struct UnreachableBlockchain;
    impl Blockchain for UnreachableBlockchain {
        fn generate_block(&self, _timestamp: u32) -> Result<bitcoin::Block, crate::errors::BlockchainError> {
            unreachable!("not exercised by these tests")
        }
        fn test_block_validity(&self, _height: u64, _block: &bitcoin::Block, _check_signet: bool) -> Result<bool, crate::errors::BlockchainError> {
            unreachable!("not exercised by these tests")
        }
        fn submit_block(&self, _height: u64, _block: &bitcoin::Block) -> Result<(), crate::errors::BlockchainError> {
            unreachable!("not exercised by these tests")
        }
    }

    struct NoopRoast;
    impl RoastDriver for NoopRoast {
        fn init(&mut self, _n: u64, _req_digest: &str, _block_hash: &[u8], _raw: Vec<(u32, Vec<u8>)>) -> (Vec<Message>, Option<Signature>) {
            (Vec::new(), None)
        }
        fn receive_pre_signature(&mut self, _msg: &Message, _block_hash: &[u8]) -> Result<Option<Message>, FbftError> {
            Ok(None)
        }
        fn receive_signature_share(&mut self, _msg: &Message) -> Result<Option<(u64, Signature)>, FbftError> {
            Ok(None)
        }
    }

    #[test]
    fn receive_block_advances_the_checkpoint() {
        let mut state = State::new(params());
        let msg = Message::unsigned(SenderRole::Replica, 0, Payload::Block { height: 1, time: 60, hash: "h".into() });
        apply(&mut state, Action::ReceiveBlock(msg), &mut StubWallet, &UnreachableBlockchain, &mut NoopRoast).unwrap();
        assert_eq!(state.h, 1);
    }

    #[test]
    fn receive_pre_prepare_for_an_unknown_request_is_rejected() {
        let mut state = State::new(params());
        let block = bitcoin::Block {
            header: bitcoin::block::Header {
                version: bitcoin::block::Version::ONE,
                prev_blockhash: bitcoin::BlockHash::all_zeros(),
                merkle_root: bitcoin::TxMerkleNode::all_zeros(),
                time: 60,
                bits: bitcoin::pow::CompactTarget::from_consensus(0),
                nonce: 0,
            },
            txdata: Vec::new(),
        };
        let proposed_block = bitcoin::consensus::serialize(&block);
        let payload = Payload::PrePrepare { v: 0, n: 1, req_digest: "(H=1, T=60)".into(), proposed_block };
        let msg = Message::unsigned(SenderRole::Replica, 0, payload);

        let err = apply(&mut state, Action::ReceivePrePrepare(msg), &mut StubWallet, &UnreachableBlockchain, &mut NoopRoast).unwrap_err();
        assert!(matches!(err, FbftError::RequestMissing));
    }
}
