//! Gossip engine error types

use huddle_store::StoreError;
use thiserror::Error;

/// Result type for gossip operations
pub type Result<T> = std::result::Result<T, GossipError>;

/// Gossip engine errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("tag decode error: {0}")]
    Decode(String),

    #[error("message decode error: {0}")]
    MessageDecode(#[from] postcard::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transaction failure: {0}")]
    Transaction(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GossipError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GossipError::ChannelClosed
    }
}
