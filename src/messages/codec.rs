//! JSON wire envelope encode/decode and signature verification plumbing.
//!
//! The envelope is `{payload: {type, ...}, signature}` plus the sender
//! fields, matching spec §4.4. Verification itself is delegated to a
//! caller-supplied key lookup (the wallet owns identity keys); this module
//! only defines what bytes are signed and how NEW_VIEW's embedded
//! VIEW_CHANGEs are checked.

use crate::errors::MessageError;
use crate::messages::{Message, Payload, ViewChangeRecord};
use crate::wallet::Wallet;

/// Serializes a [`Message`] to its wire JSON form.
pub fn encode(message: &Message) -> Result<String, MessageError> {
    Ok(serde_json::to_string(message)?)
}

/// Parses a wire JSON message.
pub fn decode(bytes: &str) -> Result<Message, MessageError> {
    Ok(serde_json::from_str(bytes)?)
}

/// A signature verifier bound to a replica's known identity keys: given a
/// fully-formed message (sender, payload, signature), reports whether the
/// signature is valid for that sender. Every [`Wallet`] is one, since
/// that's exactly what `Wallet::verify_signature` already does.
pub trait SignatureVerifier {
    fn verify(&self, msg: &Message) -> bool;
}

impl<T: Wallet + ?Sized> SignatureVerifier for T {
    fn verify(&self, msg: &Message) -> bool {
        self.verify_signature(msg)
    }
}

/// Verifies a message's own signature. BLOCK is exempt (§3: "never
/// signed").
pub fn verify_message(message: &Message, verifier: &impl SignatureVerifier) -> Result<(), MessageError> {
    if matches!(message.payload, Payload::Block { .. }) {
        return Ok(());
    }
    if verifier.verify(message) {
        Ok(())
    } else {
        Err(MessageError::SignatureInvalid)
    }
}

/// Verifies one embedded VIEW_CHANGE record from a NEW_VIEW's `Nu` set: its
/// signature covers `(sender_id, v, hi, checkpoint, p, q)`, the same fields
/// a standalone VIEW_CHANGE message signs.
fn verify_view_change_record(record: &ViewChangeRecord, verifier: &impl SignatureVerifier) -> bool {
    let payload = Payload::ViewChange {
        v: record.v,
        hi: record.hi,
        checkpoint: record.checkpoint.clone(),
        p: record.p.clone(),
        q: record.q.clone(),
    };
    let mut msg = Message::unsigned(crate::messages::SenderRole::Replica, record.sender_id, payload);
    if msg.digest() != record.digest {
        return false;
    }
    msg.signature = record.signature.clone();
    verifier.verify(&msg)
}

/// Verifies a NEW_VIEW message's own signature plus every embedded
/// VIEW_CHANGE in `Nu`, per the design note: "NEW_VIEW signatures
/// recursively require each embedded VIEW_CHANGE to verify".
pub fn verify_new_view(message: &Message, verifier: &impl SignatureVerifier) -> Result<(), MessageError> {
    verify_message(message, verifier)?;
    let Payload::NewView { nu, .. } = &message.payload else {
        return Ok(());
    };
    for record in nu {
        if !verify_view_change_record(record, verifier) {
            return Err(MessageError::SignatureInvalid);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SenderRole;

    struct AlwaysValid;
    impl SignatureVerifier for AlwaysValid {
        fn verify(&self, _msg: &Message) -> bool {
            true
        }
    }

    struct AlwaysInvalid;
    impl SignatureVerifier for AlwaysInvalid {
        fn verify(&self, _msg: &Message) -> bool {
            false
        }
    }

    #[test]
    fn round_trips_through_json() {
        let payload = Payload::Prepare { v: 0, n: 1, req_digest: "(H=1, T=60)".into() };
        let msg = Message::unsigned(SenderRole::Replica, 2, payload);
        let wire = encode(&msg).unwrap();
        let back = decode(&wire).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn block_messages_skip_verification() {
        let payload = Payload::Block { height: 1, time: 60, hash: "00".repeat(32) };
        let msg = Message::unsigned(SenderRole::Replica, 0, payload);
        assert!(verify_message(&msg, &AlwaysInvalid).is_ok());
    }

    #[test]
    fn non_block_messages_are_checked() {
        let payload = Payload::Prepare { v: 0, n: 1, req_digest: "(H=1, T=60)".into() };
        let msg = Message::unsigned(SenderRole::Replica, 1, payload);
        assert!(verify_message(&msg, &AlwaysValid).is_ok());
        assert!(verify_message(&msg, &AlwaysInvalid).is_err());
    }

    #[test]
    fn new_view_requires_all_embedded_view_changes_to_verify() {
        let vc_payload =
            Payload::ViewChange { v: 1, hi: 0, checkpoint: "c".into(), p: vec![], q: vec![] };
        let vc_msg = Message::unsigned(SenderRole::Replica, 1, vc_payload);
        let record = ViewChangeRecord {
            sender_id: 1,
            digest: vc_msg.digest(),
            v: 1,
            hi: 0,
            checkpoint: "c".into(),
            p: vec![],
            q: vec![],
            signature: vec![],
        };
        let nv_payload = Payload::NewView { v: 1, nu: vec![record], chi: vec![] };
        let nv_msg = Message::unsigned(SenderRole::Replica, 1, nv_payload);

        assert!(verify_new_view(&nv_msg, &AlwaysValid).is_ok());
        assert!(verify_new_view(&nv_msg, &AlwaysInvalid).is_err());
    }
}
