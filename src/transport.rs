//! Peer transport (§6): a pub/sub fan-out where each replica publishes on
//! its own group and subscribes to every other replica's group, plus an
//! optional sniffer tap that receives a copy of every outbound frame.
//!
//! The network transport itself is an out-of-scope external collaborator
//! (§1); this is the in-process stand-in the replica driver and its tests
//! are built against, generalized from the teacher's single-queue
//! `InMemoryTransport`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::errors::TransportError;
use crate::messages::Message;

/// Send/broadcast/receive over the peer bus.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, receiver: u32, msg: Message) -> Result<(), TransportError>;
    async fn broadcast(&self, msg: Message) -> Result<(), TransportError>;
    async fn receive(&self, own_id: u32) -> Result<Option<Message>, TransportError>;
}

type Inbox = VecDeque<Message>;

/// An in-process pub/sub fan-out: every replica has its own inbox queue; a
/// broadcast delivers to every queue except the sender's, matching "each
/// replica publishes on group `replica<id>` and subscribes to the groups
/// of the other N-1 replicas" (§6). An optional sniffer inbox receives a
/// copy of every outbound frame regardless of recipient.
pub struct InMemoryTransport {
    own_id: u32,
    inboxes: Arc<Mutex<Vec<Inbox>>>,
    sniffer: Option<Arc<Mutex<Inbox>>>,
}

impl InMemoryTransport {
    /// Builds one `InMemoryTransport` handle per replica, all sharing the
    /// same inbox set, plus a shared sniffer inbox if `with_sniffer`.
    pub fn cluster(n: u32, with_sniffer: bool) -> Vec<Self> {
        let inboxes = Arc::new(Mutex::new((0..n).map(|_| VecDeque::new()).collect()));
        let sniffer = with_sniffer.then(|| Arc::new(Mutex::new(VecDeque::new())));
        (0..n)
            .map(|id| InMemoryTransport { own_id: id, inboxes: inboxes.clone(), sniffer: sniffer.clone() })
            .collect()
    }

    fn tap(&self, msg: &Message) {
        if let Some(sniffer) = &self.sniffer {
            sniffer.lock().expect("sniffer mutex poisoned").push_back(msg.clone());
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, receiver: u32, msg: Message) -> Result<(), TransportError> {
        self.tap(&msg);
        let mut inboxes = self.inboxes.lock().map_err(|e| TransportError::Send(e.to_string()))?;
        let inbox = inboxes.get_mut(receiver as usize).ok_or_else(|| TransportError::Send("unknown receiver".into()))?;
        inbox.push_back(msg);
        Ok(())
    }

    async fn broadcast(&self, msg: Message) -> Result<(), TransportError> {
        self.tap(&msg);
        let mut inboxes = self.inboxes.lock().map_err(|e| TransportError::Broadcast(e.to_string()))?;
        for (id, inbox) in inboxes.iter_mut().enumerate() {
            if id as u32 != self.own_id {
                inbox.push_back(msg.clone());
            }
        }
        Ok(())
    }

    async fn receive(&self, own_id: u32) -> Result<Option<Message>, TransportError> {
        let mut inboxes = self.inboxes.lock().map_err(|e| TransportError::Receive(e.to_string()))?;
        let inbox = inboxes.get_mut(own_id as usize).ok_or_else(|| TransportError::Receive("unknown id".into()))?;
        Ok(inbox.pop_front())
    }
}
