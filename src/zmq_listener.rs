//! New-block notification listener (§6): subscribes to the chain node's
//! `zmqpubitcoinblock` publisher and turns each three-frame message into a
//! `BLOCK` [`Message`].
//!
//! Grounded in `other_examples/manifests/chainflip-io-chainflip-backend`'s
//! use of the `zmq` crate for exactly this kind of chain-event subscriber.

use crate::errors::BlockchainError;
use crate::messages::{Message, Payload, SenderRole};

const TOPIC: &str = "itcoinblock";

/// Parses the exact three-frame format: `"itcoinblock" || payload(40B) ||
/// seq(4B LE)`, where `payload = block-hash(32B LE) || height(i32 LE) ||
/// time(u32 LE)`.
pub fn parse_frames(topic: &[u8], payload: &[u8], _seq: &[u8]) -> Result<Message, BlockchainError> {
    if topic != TOPIC.as_bytes() {
        return Err(BlockchainError::Rpc(format!("unexpected zmq topic {:?}", String::from_utf8_lossy(topic))));
    }
    if payload.len() != 40 {
        return Err(BlockchainError::Rpc(format!("expected 40-byte block payload, got {}", payload.len())));
    }

    let mut hash_le = [0u8; 32];
    hash_le.copy_from_slice(&payload[0..32]);
    hash_le.reverse(); // wire order is LE; display/compare as big-endian hex.
    let height = i32::from_le_bytes(payload[32..36].try_into().unwrap());
    let time = u32::from_le_bytes(payload[36..40].try_into().unwrap());

    let payload = Payload::Block { height: height as u64, time, hash: hex::encode(hash_le) };
    Ok(Message::unsigned(SenderRole::Replica, 0, payload))
}

/// Blocking ZMQ SUB socket over `endpoint`, yielding parsed [`Message`]s.
/// Runs on a dedicated blocking thread per call site (the zmq crate's
/// socket API is synchronous).
pub struct ZmqBlockListener {
    socket: zmq::Socket,
}

impl ZmqBlockListener {
    pub fn connect(endpoint: &str) -> Result<Self, BlockchainError> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::SUB).map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        socket.connect(endpoint).map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        socket.set_subscribe(TOPIC.as_bytes()).map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        Ok(ZmqBlockListener { socket })
    }

    /// Blocks until the next BLOCK notification arrives.
    pub fn recv(&self) -> Result<Message, BlockchainError> {
        let frames = self.socket.recv_multipart(0).map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        let [topic, payload, seq]: [Vec<u8>; 3] =
            frames.try_into().map_err(|_| BlockchainError::Rpc("expected exactly three zmq frames".into()))?;
        parse_frames(&topic, &payload, &seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_notification() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xAA; 32]);
        payload.extend_from_slice(&42i32.to_le_bytes());
        payload.extend_from_slice(&1_700_000_000u32.to_le_bytes());

        let msg = parse_frames(TOPIC.as_bytes(), &payload, &[0, 0, 0, 0]).unwrap();
        match msg.payload {
            Payload::Block { height, time, .. } => {
                assert_eq!(height, 42);
                assert_eq!(time, 1_700_000_000);
            }
            _ => panic!("expected BLOCK payload"),
        }
    }

    #[test]
    fn rejects_wrong_payload_length() {
        assert!(parse_frames(TOPIC.as_bytes(), &[0u8; 10], &[0; 4]).is_err());
    }

    #[test]
    fn rejects_unexpected_topic() {
        let payload = [0u8; 40];
        assert!(parse_frames(b"othertopic", &payload, &[0; 4]).is_err());
    }
}
