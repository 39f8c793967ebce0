//! The 18-member FBFT action set (§4.5) and `active_actions`, the pure
//! query over [`State`] that replaces the reference implementation's
//! Prolog `BuildActives` predicates (§9 "Global engine state").

use crate::messages::{Message, Payload, Request};

use super::state::State;

/// One of the 18 actions named in §4.5, carrying just enough data for
/// [`super::apply::apply`] to act on it without re-deriving it from state.
#[derive(Clone, Debug)]
pub enum Action {
    ReceiveRequest(Request),
    ReceivePrePrepare(Message),
    ReceivePrepare(Message),
    ReceiveCommit(Message),
    ReceiveViewChange(Message),
    ReceiveNewView(Message),
    ReceiveBlock(Message),
    SendPrePrepare { v: u64, n: u64, req_digest: String },
    SendPrepare { v: u64, n: u64, req_digest: String },
    SendCommit { v: u64, n: u64, req_digest: String },
    SendViewChange { new_view: u64 },
    SendNewView { v: u64 },
    ProcessNewView { v: u64 },
    RecoverView { v: u64 },
    Execute { v: u64, n: u64 },
    RoastInit { n: u64 },
    RoastReceivePreSignature(Message),
    RoastReceiveSignatureShare(Message),
}

/// Recomputes every currently-admissible action. The replica driver draws
/// from this set at random each cycle (§4.6); the order here carries no
/// meaning.
pub fn active_actions(state: &State) -> Vec<Action> {
    let mut actions = Vec::new();

    for msg in &state.in_buffer {
        actions.push(match &msg.payload {
            Payload::Block { .. } => Action::ReceiveBlock(msg.clone()),
            Payload::PrePrepare { .. } => Action::ReceivePrePrepare(msg.clone()),
            Payload::Prepare { .. } => Action::ReceivePrepare(msg.clone()),
            Payload::Commit { .. } => Action::ReceiveCommit(msg.clone()),
            Payload::ViewChange { .. } => Action::ReceiveViewChange(msg.clone()),
            Payload::NewView { .. } => Action::ReceiveNewView(msg.clone()),
            Payload::RoastPreSignature { .. } => Action::RoastReceivePreSignature(msg.clone()),
            Payload::RoastSignatureShare { .. } => Action::RoastReceiveSignatureShare(msg.clone()),
        });
    }

    let v = state.view;
    let n = state.h + 1;

    if state.params.is_primary(v) && !state.has_pre_prepare(v, n) {
        if let Some((digest, _req)) = state.request_for_seq(n) {
            actions.push(Action::SendPrePrepare { v, n, req_digest: digest.clone() });
        }
    }

    if !state.params.is_primary(v) {
        if let Some(pp) = state.pre_prepares.get(&(v, n)) {
            if let Payload::PrePrepare { req_digest, .. } = &pp.payload {
                let already_sent = state
                    .prepares
                    .get(&(v, n))
                    .map(|by_sender| by_sender.contains_key(&state.params.id))
                    .unwrap_or(false);
                if !already_sent {
                    actions.push(Action::SendPrepare { v, n, req_digest: req_digest.clone() });
                }
            }
        }
    }

    if let Some(pp) = state.pre_prepares.get(&(v, n)) {
        if let Payload::PrePrepare { req_digest, .. } = &pp.payload {
            if state.has_prepared_certificate(v, n, req_digest) {
                let already_sent =
                    state.commits.get(&(v, n)).map(|by_sender| by_sender.contains_key(&state.params.id)).unwrap_or(false);
                if !already_sent {
                    actions.push(Action::SendCommit { v, n, req_digest: req_digest.clone() });
                }
            }
        }
    }

    if state.commit_count(v, n) as u32 >= state.params.quorum() {
        if n == state.h + 1 {
            if state.finalized_signatures.contains_key(&n) {
                actions.push(Action::Execute { v, n });
            } else {
                actions.push(Action::RoastInit { n });
            }
        }
    }

    if let Some(timer) = &state.view_change_timer {
        if timer.expired(state.synthetic_time, state.params.target_block_time) {
            actions.push(Action::SendViewChange { new_view: state.view + 1 });
        }
    }

    for (&candidate_v, _) in &state.view_changes {
        if candidate_v > state.view
            && state.view_change_count(candidate_v) as u32 >= state.params.quorum()
            && state.params.is_primary(candidate_v)
            && !state.new_views.contains_key(&candidate_v)
        {
            actions.push(Action::SendNewView { v: candidate_v });
        }
    }

    for (&candidate_v, _) in &state.new_views {
        if candidate_v > state.view {
            if candidate_v == state.view + 1 {
                actions.push(Action::ProcessNewView { v: candidate_v });
            } else {
                actions.push(Action::RecoverView { v: candidate_v });
            }
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fbft::state::ReplicaParams;

    fn params(id: u32) -> ReplicaParams {
        ReplicaParams { id, n: 4, genesis_block_timestamp: 0, target_block_time: 60.0 }
    }

    #[test]
    fn idle_replica_proposes_nothing() {
        let state = State::new(params(0));
        assert!(active_actions(&state).is_empty());
    }

    #[test]
    fn primary_with_a_pending_request_proposes_a_pre_prepare() {
        let mut state = State::new(params(0));
        let req = Request { genesis_block_timestamp: 0, target_block_time: 60.0, timestamp: 60 };
        state.requests.insert(req.digest(), req);

        let actions = active_actions(&state);
        assert!(matches!(
            actions.as_slice(),
            [Action::SendPrePrepare { v: 0, n: 1, req_digest }] if req_digest == "(H=1, T=60)"
        ));
    }

    #[test]
    fn non_primary_with_the_same_pending_request_proposes_nothing() {
        let mut state = State::new(params(1));
        let req = Request { genesis_block_timestamp: 0, target_block_time: 60.0, timestamp: 60 };
        state.requests.insert(req.digest(), req);

        assert!(active_actions(&state).is_empty());
    }

    #[test]
    fn expired_view_change_timer_proposes_send_view_change() {
        let mut state = State::new(params(1));
        state.view_change_timer = Some(crate::fbft::state::ViewChangeTimer { started_at: 0, k: 0 });
        state.synthetic_time = 30;

        let actions = active_actions(&state);
        assert!(matches!(actions.as_slice(), [Action::SendViewChange { new_view: 1 }]));
    }
}
