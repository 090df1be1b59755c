//! Message transport seam
//!
//! The engine only needs fire-and-forget delivery to a set of names;
//! whether that maps onto UDP datagrams, a framed TCP stream, or an
//! in-process queue is the transport's business. Sends must not block the
//! caller.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::GossipMessage;

/// Outbound message delivery to a member identified by its name set.
pub trait Transport: Send + Sync {
    fn send(&self, to: &[String], message: GossipMessage);
}

/// Transport that hands every outbound message to an mpsc receiver.
///
/// Used by tests to inspect engine output and by in-process wiring that
/// pumps the receiver into other engines.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(Vec<String>, GossipMessage)>,
}

impl ChannelTransport {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(Vec<String>, GossipMessage)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: &[String], message: GossipMessage) {
        if self.tx.send((to.to_vec(), message)).is_err() {
            trace!("transport receiver dropped; message discarded");
        }
    }
}
