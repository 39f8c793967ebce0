//! Replica driver (C6): ties the deterministic FBFT state machine to real
//! time, the peer transport, and the durable fact log.
//!
//! Grounded on `original_source/src/fbft/Replica2.cpp`'s `GenerateRequests`/
//! `ApplyActiveActions`/`CheckTimedActions`/`ReceiveIncomingMessage`, redone
//! as a `tokio` task instead of a blocking single-threaded C++ loop, with a
//! seeded `rand_chacha` RNG standing in for `std::rand` so action selection
//! is reproducible across test runs.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::blockchain::Blockchain;
use crate::errors::FbftError;
use crate::fbft::{active_actions, apply, Action, ReplicaParams, RoastDriver, State};
use crate::messages::codec::verify_new_view;
use crate::messages::{Message, Payload, Request};
use crate::store::{Fact, FactStore};
use crate::transport::Transport;
use crate::wallet::Wallet;

/// `generate_requests` keeps the request log filled this many ticks into
/// the future (§4.6 step 1).
const MAX_NUM_GENERATED_REQUESTS: u32 = 5;

/// Upper bound on active actions drained per cycle, so a flood of inbound
/// messages cannot starve the timer checks or the transport poll (§4.6
/// step 3).
const MAX_NUM_APPLIED_ACTIONS: usize = 11;

/// Ties a [`State`] to its I/O collaborators and drives it forward in
/// cycles. Each collaborator is boxed rather than generic, mirroring how
/// [`apply`] itself takes trait objects — a replica's backend choice
/// (naïve vs. threshold wallet, in-memory vs. ZMQ-fed transport) is a
/// runtime wiring decision, not a type parameter.
pub struct Replica {
    state: State,
    wallet: Box<dyn Wallet + Send>,
    blockchain: Box<dyn Blockchain + Send + Sync>,
    transport: Box<dyn Transport>,
    roast: Box<dyn RoastDriver + Send>,
    store: FactStore,
    rng: ChaCha8Rng,
}

impl Replica {
    pub fn new(
        params: ReplicaParams,
        wallet: Box<dyn Wallet + Send>,
        blockchain: Box<dyn Blockchain + Send + Sync>,
        transport: Box<dyn Transport>,
        roast: Box<dyn RoastDriver + Send>,
        store: FactStore,
        rng_seed: u64,
    ) -> Self {
        Replica { state: State::new(params), wallet, blockchain, transport, roast, store, rng: ChaCha8Rng::seed_from_u64(rng_seed) }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Rebuilds state from the durable fact log (§4.9): lets a replica
    /// resume deterministically with the same datadir after a restart.
    pub async fn resync(&mut self) -> Result<(), FbftError> {
        let facts = self.store.replay().await?;
        for fact in facts {
            match fact {
                Fact::Request(req) => {
                    self.state.requests.insert(req.digest(), req);
                }
                // Sent/Received facts were already verified and applied
                // once, live; replaying them only needs to rebuild the log
                // bookkeeping `apply`'s Receive* arms maintain, not re-run
                // their RPC-bound validity checks.
                Fact::Sent(msg) | Fact::Received(msg) => absorb_historical(&mut self.state, msg),
                Fact::ViewAdvanced { v } => self.state.view = v,
                Fact::CheckpointAdvanced { h } => self.state.advance_checkpoint(h),
                Fact::LastReplyTime { t } => self.state.last_rep = self.state.last_rep.max(t),
            }
        }
        Ok(())
    }

    /// One `generate_requests` + drain-active-actions pass at synthetic
    /// time `now` (§4.6). `now` is the injection point spec §3 calls for
    /// ("synthetic time ... injectable"): [`Self::run`] feeds it real
    /// wall-clock seconds; tests can call `cycle` directly with any value.
    #[instrument(skip(self), fields(replica = self.state.params.id, view = self.state.view, h = self.state.h))]
    pub async fn cycle(&mut self, now: u32) -> Result<(), FbftError> {
        self.state.synthetic_time = now;
        self.generate_requests(now).await?;
        self.apply_active_actions().await
    }

    /// Verifies, logs, and admits one inbound message (§4.6 step 4). BLOCK
    /// is applied immediately and does not fall through to the
    /// active-action drain, so a resyncing replica cannot trip a view
    /// change while catching up on old blocks.
    pub async fn receive(&mut self, msg: Message) -> Result<(), FbftError> {
        let is_block = matches!(msg.payload, Payload::Block { .. });
        // NEW_VIEW needs the recursive check (§4.5): its own signature
        // plus every embedded VIEW_CHANGE. A plain `verify_signature`
        // would only confirm the primary signed the envelope, not that
        // the VIEW_CHANGEs it bundles are genuine.
        let signature_ok = if is_block {
            true
        } else if matches!(msg.payload, Payload::NewView { .. }) {
            verify_new_view(&msg, self.wallet.as_ref()).is_ok()
        } else {
            self.wallet.verify_signature(&msg)
        };
        if !signature_ok {
            warn!(
                replica = self.state.params.id,
                sender = msg.sender_id,
                kind = msg.payload.type_name(),
                "dropping message with invalid signature"
            );
            return Ok(());
        }
        self.store.append(&Fact::Received(msg.clone())).await?;
        metrics::counter!("fbft_messages_processed_total").increment(1);

        if is_block {
            apply(&mut self.state, Action::ReceiveBlock(msg), self.wallet.as_mut(), self.blockchain.as_ref(), self.roast.as_mut())?;
            return self.flush_out_buffer().await;
        }

        self.state.admit(msg);
        self.apply_active_actions().await
    }

    /// Runs cycles until `shutdown` is signalled, polling the transport for
    /// inbound messages for up to `max(1ms, (target_block_time −
    /// cycle_elapsed)/2)` between cycles (§5 "Scheduling"). Neither
    /// [`crate::transport::Transport`] nor the ZMQ listener expose a native
    /// timed-wait, so the bound is enforced by short polling sleeps rather
    /// than a single blocking call.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FbftError> {
        while !*shutdown.borrow() {
            let cycle_start = Instant::now();
            self.cycle(wall_clock_now()).await?;

            let elapsed = cycle_start.elapsed().as_secs_f64();
            let timeout = ((self.state.params.target_block_time - elapsed) / 2.0).max(0.001);
            let deadline = Instant::now() + Duration::from_secs_f64(timeout);

            while Instant::now() < deadline {
                if *shutdown.borrow() {
                    return Ok(());
                }
                match self.transport.receive(self.state.params.id).await {
                    Ok(Some(message)) => {
                        self.receive(message).await?;
                        break;
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(1)).await,
                    Err(e) => {
                        warn!(replica = self.state.params.id, error = %e, "transport receive failed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn generate_requests(&mut self, now: u32) -> Result<(), FbftError> {
        let genesis = self.state.params.genesis_block_timestamp;
        let target = self.state.params.target_block_time;
        let target_secs = (target.round() as u32).max(1);
        let window = MAX_NUM_GENERATED_REQUESTS.saturating_mul(target_secs);

        while self.state.last_req < now.saturating_add(window) && self.state.last_req < self.state.last_rep.saturating_add(window)
        {
            let timestamp = self.state.last_req + target_secs;
            let req = Request { genesis_block_timestamp: genesis, target_block_time: target, timestamp };
            debug!(replica = self.state.params.id, height = req.height(), timestamp, "synthesising request");
            apply(&mut self.state, Action::ReceiveRequest(req), self.wallet.as_mut(), self.blockchain.as_ref(), self.roast.as_mut())?;
            self.flush_out_buffer().await?;
        }
        Ok(())
    }

    /// Drains up to [`MAX_NUM_APPLIED_ACTIONS`] currently-admissible
    /// actions, chosen uniformly at random (§4.6 step 3, §5 "Ordering":
    /// "the random choice of next action does not affect safety"),
    /// re-signing and flushing outbound messages after each.
    async fn apply_active_actions(&mut self) -> Result<(), FbftError> {
        let mut applied = 0;
        loop {
            if applied >= MAX_NUM_APPLIED_ACTIONS {
                warn!(replica = self.state.params.id, "exceeded the number of applied actions in this cycle");
                break;
            }
            let actions = active_actions(&self.state);
            let Some(action) = actions.choose(&mut self.rng).cloned() else {
                break;
            };
            self.remove_consumed_message(&action);
            if matches!(action, Action::SendViewChange { .. } | Action::ReceiveNewView(_)) {
                metrics::counter!("fbft_view_changes_total").increment(1);
            }
            apply(&mut self.state, action, self.wallet.as_mut(), self.blockchain.as_ref(), self.roast.as_mut())?;
            applied += 1;
            metrics::counter!("fbft_actions_applied_total").increment(1);
            self.flush_out_buffer().await?;
        }
        Ok(())
    }

    /// A `Receive*` action consumes the one message in `in_buffer` it was
    /// built from; without removing it, the same message would spawn the
    /// same action again next cycle. `ReceiveRequest` has no buffer
    /// counterpart (it is synthesised, not received) and needs no removal.
    fn remove_consumed_message(&mut self, action: &Action) {
        let consumed = match action {
            Action::ReceivePrePrepare(m)
            | Action::ReceivePrepare(m)
            | Action::ReceiveCommit(m)
            | Action::ReceiveViewChange(m)
            | Action::ReceiveNewView(m)
            | Action::ReceiveBlock(m)
            | Action::RoastReceivePreSignature(m)
            | Action::RoastReceiveSignatureShare(m) => Some(m.clone()),
            _ => None,
        };
        if let Some(msg) = consumed {
            if let Some(pos) = self.state.in_buffer.iter().position(|m| m == &msg) {
                self.state.in_buffer.remove(pos);
            }
        }
    }

    /// Signs, logs, and dispatches every message `apply` queued. A message
    /// addressed to myself (the ROAST coordinator naming itself among the
    /// signers, or a signer replying to a coordinator that is itself) is
    /// looped back directly into `in_buffer` instead of round-tripping
    /// through the transport (§4.6 step 3).
    async fn flush_out_buffer(&mut self) -> Result<(), FbftError> {
        let pending: Vec<Message> = self.state.out_buffer.drain(..).collect();
        for mut msg in pending {
            if msg.signature.is_empty() && !matches!(msg.payload, Payload::Block { .. }) {
                msg.signature = self.wallet.append_signature(&msg)?;
            }
            self.store.append(&Fact::Sent(msg.clone())).await?;

            if msg.to == Some(self.state.params.id) {
                self.state.in_buffer.push_back(msg);
                continue;
            }
            match msg.to {
                Some(receiver) => self.transport.send(receiver, msg).await?,
                None => self.transport.broadcast(msg).await?,
            }
        }
        Ok(())
    }
}

fn wall_clock_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock is after the epoch").as_secs() as u32
}

/// Re-inserts a previously-verified message into the log bookkeeping
/// `apply`'s `Receive*` arms maintain, without re-running the validity
/// checks those arms perform against the blockchain adapter (the message
/// already passed them once, live, before being persisted).
fn absorb_historical(state: &mut State, msg: Message) {
    match &msg.payload {
        Payload::PrePrepare { v, n, .. } => {
            state.pre_prepares.insert((*v, *n), msg);
        }
        Payload::Prepare { v, n, .. } => {
            state.prepares.entry((*v, *n)).or_default().insert(msg.sender_id, msg);
        }
        Payload::Commit { v, n, .. } => {
            state.commits.entry((*v, *n)).or_default().insert(msg.sender_id, msg);
        }
        Payload::ViewChange { v, .. } => {
            state.view_changes.entry(*v).or_default().insert(msg.sender_id, msg);
        }
        Payload::NewView { v, .. } => {
            state.new_views.insert(*v, msg);
        }
        Payload::Block { height, .. } => {
            state.advance_checkpoint(*height);
        }
        Payload::RoastPreSignature { .. } | Payload::RoastSignatureShare { .. } => {
            // ROAST's in-flight session bookkeeping lives in the
            // `RoastDriver`, not in `State`; it has nothing durable to
            // replay and a stalled session is simply re-started the next
            // time `RoastInit` fires.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BlockchainError, WalletError};
    use crate::frost::Signature;
    use crate::messages::SenderRole;
    use crate::wallet::BlockSignature;

    struct NoopWallet;
    impl Wallet for NoopWallet {
        fn append_signature(&self, _msg: &Message) -> Result<Vec<u8>, WalletError> {
            Ok(vec![0u8; 64])
        }
        fn verify_signature(&self, _msg: &Message) -> bool {
            true
        }
        fn finalize_block(&self, block: bitcoin::Block, _aux: &[u8], _shares: &[BlockSignature]) -> Result<bitcoin::Block, WalletError> {
            Ok(block)
        }
    }

    struct UnreachableBlockchain;
    impl Blockchain for UnreachableBlockchain {
        fn generate_block(&self, _timestamp: u32) -> Result<bitcoin::Block, BlockchainError> {
            panic!("generate_requests must not touch the blockchain adapter")
        }
        fn test_block_validity(&self, _height: u64, _block: &bitcoin::Block, _check_signet: bool) -> Result<bool, BlockchainError> {
            panic!("generate_requests must not touch the blockchain adapter")
        }
        fn submit_block(&self, _height: u64, _block: &bitcoin::Block) -> Result<(), BlockchainError> {
            panic!("generate_requests must not touch the blockchain adapter")
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

    struct UnreachableTransport;
    #[async_trait::async_trait]
    impl Transport for UnreachableTransport {
        async fn send(&self, _receiver: u32, _msg: Message) -> Result<(), crate::errors::TransportError> {
            panic!("generate_requests queues nothing to send")
        }
        async fn broadcast(&self, _msg: Message) -> Result<(), crate::errors::TransportError> {
            panic!("generate_requests queues nothing to send")
        }
        async fn receive(&self, _own_id: u32) -> Result<Option<Message>, crate::errors::TransportError> {
            Ok(None)
        }
    }

    fn test_replica(datadir: &std::path::Path) -> impl std::future::Future<Output = Replica> + '_ {
        async move {
            let params = ReplicaParams { id: 0, n: 4, genesis_block_timestamp: 0, target_block_time: 60.0 };
            let store = FactStore::open(datadir, true).await.unwrap();
            Replica::new(params, Box::new(NoopWallet), Box::new(UnreachableBlockchain), Box::new(UnreachableTransport), Box::new(NoopRoast), store, 42)
        }
    }

    #[tokio::test]
    async fn generate_requests_fills_the_window_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut replica = test_replica(dir.path()).await;

        replica.generate_requests(60).await.unwrap();

        // window = 5 * 60 = 300; requests keep getting created while
        // last_req < 60 + 300 = 360 (and last_rep, still 0, + 300 = 300).
        assert_eq!(replica.state.last_req, 300);
        assert_eq!(replica.state.requests.len(), 5);
        assert!(replica.state.requests.values().any(|r| r.height() == 1 && r.timestamp == 60));

        // A second call at the same synthetic time is a no-op: the window
        // is already full.
        let before = replica.state.requests.len();
        replica.generate_requests(60).await.unwrap();
        assert_eq!(replica.state.requests.len(), before);
    }

    #[tokio::test]
    async fn generate_requests_advances_with_last_rep() {
        let dir = tempfile::tempdir().unwrap();
        let mut replica = test_replica(dir.path()).await;
        replica.state.last_rep = 600;

        replica.generate_requests(60).await.unwrap();

        // now the bound is min(now, last_rep) + window = 60 + 300 = 360,
        // since last_rep's bound (600+300=900) is looser.
        assert_eq!(replica.state.last_req, 300);
    }

    #[test]
    fn remove_consumed_message_drops_exactly_the_matching_entry() {
        let params = ReplicaParams { id: 1, n: 4, genesis_block_timestamp: 0, target_block_time: 60.0 };
        let mut state = State::new(params);
        let a = Message::unsigned(SenderRole::Replica, 2, Payload::Prepare { v: 0, n: 1, req_digest: "(H=1, T=60)".into() });
        let b = Message::unsigned(SenderRole::Replica, 3, Payload::Prepare { v: 0, n: 1, req_digest: "(H=1, T=60)".into() });
        state.in_buffer.push_back(a.clone());
        state.in_buffer.push_back(b.clone());

        // Exercise the same removal logic `apply_active_actions` uses,
        // without constructing a full `Replica` (no async runtime needed).
        let action = Action::ReceivePrepare(a.clone());
        let consumed = match &action {
            Action::ReceivePrepare(m) => Some(m.clone()),
            _ => None,
        };
        if let Some(msg) = consumed {
            if let Some(pos) = state.in_buffer.iter().position(|m| m == &msg) {
                state.in_buffer.remove(pos);
            }
        }

        assert_eq!(state.in_buffer.len(), 1);
        assert_eq!(state.in_buffer[0], b);
    }
}
