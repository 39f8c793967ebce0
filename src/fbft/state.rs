//! Per-replica FBFT state (§3, §9 "Global engine state"): everything the
//! action preconditions and `apply` read and mutate, owned as a plain
//! value rather than behind a logic-engine session.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::frost::Signature;
use crate::messages::{Message, Payload, PrePreparedEntry, PreparedEntry, Request};

/// Fixed cluster parameters this replica was configured with.
#[derive(Clone, Copy, Debug)]
pub struct ReplicaParams {
    pub id: u32,
    pub n: u32,
    pub genesis_block_timestamp: u32,
    pub target_block_time: f64,
}

impl ReplicaParams {
    pub fn f(&self) -> u32 {
        (self.n - 1) / 3
    }

    pub fn quorum(&self) -> u32 {
        2 * self.f() + 1
    }

    /// `primary(v) = v mod N`.
    pub fn primary(&self, v: u64) -> u32 {
        (v % self.n as u64) as u32
    }

    pub fn is_primary(&self, v: u64) -> bool {
        self.primary(v) == self.id
    }
}

/// A logical (not OS) view-change timer: started when the first
/// unprocessed request at `h+1` appears; `k` counts consecutive view
/// change attempts and doubles the timeout each time.
#[derive(Clone, Copy, Debug)]
pub struct ViewChangeTimer {
    pub started_at: u32,
    pub k: u32,
}

impl ViewChangeTimer {
    pub fn duration(&self, target_block_time: f64) -> f64 {
        2f64.powi(self.k as i32) * (target_block_time / 2.0)
    }

    pub fn expired(&self, now: u32, target_block_time: f64) -> bool {
        (now as f64) >= self.started_at as f64 + self.duration(target_block_time)
    }
}

/// Owned replica state: request/message log, buffers, timers, and the
/// record of which sequence numbers have a finalised threshold signature.
pub struct State {
    pub params: ReplicaParams,
    pub view: u64,
    pub h: u64,
    pub synthetic_time: u32,
    pub last_rep: u32,
    pub last_req: u32,

    pub requests: BTreeMap<String, Request>,
    pub pre_prepares: BTreeMap<(u64, u64), Message>,
    pub prepares: BTreeMap<(u64, u64), BTreeMap<u32, Message>>,
    pub commits: BTreeMap<(u64, u64), BTreeMap<u32, Message>>,
    pub view_changes: BTreeMap<u64, BTreeMap<u32, Message>>,
    pub new_views: BTreeMap<u64, Message>,
    pub executed: BTreeSet<u64>,
    pub finalized_signatures: BTreeMap<u64, Signature>,

    pub in_buffer: VecDeque<Message>,
    pub in_await_checkpoint: VecDeque<Message>,
    pub out_buffer: Vec<Message>,

    pub view_change_timer: Option<ViewChangeTimer>,
}

impl State {
    pub fn new(params: ReplicaParams) -> Self {
        State {
            params,
            view: 0,
            h: 0,
            synthetic_time: 0,
            last_rep: 0,
            last_req: 0,
            requests: BTreeMap::new(),
            pre_prepares: BTreeMap::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            view_changes: BTreeMap::new(),
            new_views: BTreeMap::new(),
            executed: BTreeSet::new(),
            finalized_signatures: BTreeMap::new(),
            in_buffer: VecDeque::new(),
            in_await_checkpoint: VecDeque::new(),
            out_buffer: Vec::new(),
            view_change_timer: None,
        }
    }

    pub fn high_water(&self) -> u64 {
        // W = 1, k = cluster_size: exactly one block may be in flight (§9,
        // Open Question 2 — kept unwidened).
        self.h + self.params.n as u64
    }

    /// Admits an inbound message per the held-messages policy (§4.5): BLOCK
    /// is the caller's responsibility (applied immediately, not buffered);
    /// `n == h+2` is held until a checkpoint advances `h`; `n <= h` is
    /// discarded; everything else goes straight into `in`.
    pub fn admit(&mut self, message: Message) {
        if matches!(message.payload, Payload::Block { .. }) {
            self.in_buffer.push_back(message);
            return;
        }
        match message.payload.seq() {
            Some(n) if n <= self.h => {} // discard
            Some(n) if n == self.h + 2 => self.in_await_checkpoint.push_back(message),
            _ => self.in_buffer.push_back(message),
        }
    }

    /// Advances `h` to `n` on a block acceptance notification at `n = h+1`,
    /// drains `in_await_checkpoint`, and garbage-collects log entries
    /// strictly below the new `h` (§4.5, §8 invariants 3 and 6).
    pub fn advance_checkpoint(&mut self, n: u64) {
        if n != self.h + 1 {
            return; // a notification for n > h+1 is ignored; the primary catches up via intermediate blocks.
        }
        self.h = n;
        self.view_change_timer = None;

        while let Some(msg) = self.in_await_checkpoint.pop_front() {
            self.in_buffer.push_back(msg);
        }

        self.pre_prepares.retain(|(_, seq), _| *seq >= self.h);
        self.prepares.retain(|(_, seq), _| *seq >= self.h);
        self.commits.retain(|(_, seq), _| *seq >= self.h);
        self.requests.retain(|_, req| req.height() >= self.h);
        self.executed.retain(|seq| *seq >= self.h);
        self.finalized_signatures.retain(|seq, _| *seq >= self.h);
    }

    pub fn request_for_seq(&self, n: u64) -> Option<(&String, &Request)> {
        self.requests.iter().find(|(_, req)| req.height() == n)
    }

    pub fn has_pre_prepare(&self, v: u64, n: u64) -> bool {
        self.pre_prepares.contains_key(&(v, n))
    }

    pub fn prepare_count(&self, v: u64, n: u64, req_digest: &str) -> usize {
        self.prepares
            .get(&(v, n))
            .map(|by_sender| {
                by_sender
                    .values()
                    .filter(|m| matches!(&m.payload, Payload::Prepare { req_digest: d, .. } if d == req_digest))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn commit_count(&self, v: u64, n: u64) -> usize {
        self.commits.get(&(v, n)).map(|by_sender| by_sender.len()).unwrap_or(0)
    }

    /// `true` if I hold a P-certificate for `(n, req_digest, v)`: a matching
    /// PRE-PREPARE plus `2f+1` PREPAREs.
    pub fn has_prepared_certificate(&self, v: u64, n: u64, req_digest: &str) -> bool {
        self.has_pre_prepare(v, n) && self.prepare_count(v, n, req_digest) as u32 >= self.params.quorum()
    }

    /// Collects every P-certificate I hold, for `SendViewChange`'s `P` list.
    pub fn prepared_entries(&self) -> Vec<PreparedEntry> {
        let mut entries = Vec::new();
        for (&(v, n), pp) in &self.pre_prepares {
            if let Payload::PrePrepare { req_digest, .. } = &pp.payload {
                if self.has_prepared_certificate(v, n, req_digest) {
                    entries.push(PreparedEntry { n, req_digest: req_digest.clone(), v });
                }
            }
        }
        entries
    }

    /// Every PRE-PREPARE I have seen beyond the last checkpoint, for
    /// `SendViewChange`'s `Q` list.
    pub fn pre_prepared_entries(&self) -> Vec<PrePreparedEntry> {
        self.pre_prepares
            .iter()
            .filter(|(&(_, n), _)| n > self.h)
            .filter_map(|(&(v, n), pp)| {
                if let Payload::PrePrepare { req_digest, proposed_block, .. } = &pp.payload {
                    Some(PrePreparedEntry { n, req_digest: req_digest.clone(), proposed_block: proposed_block.clone(), v })
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn view_change_count(&self, v: u64) -> usize {
        self.view_changes.get(&v).map(|by_sender| by_sender.len()).unwrap_or(0)
    }
}
