//! Wire protocol for failure-detection messages

use serde::{Deserialize, Serialize};

use crate::error::{GossipError, Result};

/// Maximum message size (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Failure-detection messages exchanged between members.
///
/// Messages address members by name set; an empty `names_proxy_for` marks a
/// direct ack, a non-empty one carries the original target of a proxied
/// probe so the receiver can resolve which outstanding probe it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Direct liveness probe. Answered with `Ack` carrying the same id.
    Ping { id: u64 },
    /// Probe answer. `names_proxy_for` is empty for direct acks and names
    /// the original target for relayed ones.
    Ack { id: u64, names_proxy_for: Vec<String> },
    /// Ask the receiver to probe `name` on the sender's behalf and relay
    /// the ack back.
    PingReq { id: u64, name: Vec<String> },
}

/// Serialize a message.
pub fn encode_message(message: &GossipMessage) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(GossipError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(payload)
}

/// Deserialize a message.
pub fn decode_message(payload: &[u8]) -> Result<GossipMessage> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(GossipError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(postcard::from_bytes(payload)?)
}

/// Prefix a payload with its 4-byte big-endian length.
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Read a frame length prefix.
pub fn frame_length(prefix: &[u8; 4]) -> usize {
    u32::from_be_bytes(*prefix) as usize
}
