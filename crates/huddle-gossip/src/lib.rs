//! # Huddle Gossip
//!
//! SWIM-style failure detection and membership state over the huddle
//! membership store:
//! - **Failure detector**: periodic direct probes, indirect probes through
//!   random proxies, round-trip tracking
//! - **Suspicion lifecycle**: an expiry queue promotes silent members from
//!   SUSPECTED to DEAD after ten gossip periods
//! - **Membership tags**: versioned ALIVE/SUSPECTED/DEAD/LEFT state per
//!   member, merged under SWIM precedence (higher version wins; at equal
//!   versions LEFT > DEAD > SUSPECTED > ALIVE)
//! - **Region floors**: DEAD members are only removed while their region
//!   keeps a configured minimum of members; LEFT members go unconditionally
//! - **Leaving archive**: removed identities linger for thirty gossip
//!   periods so late gossip about them is recognized
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! ├──────────────┬───────────────────┬──────────────────────────┤
//! │   Detector   │      Reactor      │         Registries       │
//! ├──────────────┼───────────────────┼──────────────────────────┤
//! │ • ping       │ • commit hook     │ • suspicion queue        │
//! │ • ping-req   │ • region index    │ • round-trip table       │
//! │ • ack        │ • state tallies   │ • leaving archive        │
//! │ • timeouts   │ • dead sweeping   │ • outstanding probes     │
//! └──────────────┴───────────────────┴──────────────────────────┘
//!         │                 │
//!     Transport       huddle-store (tags, transactions, hooks)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use huddle_gossip::{Engine, GossipConfig};
//! use huddle_store::Cluster;
//!
//! let cluster = Cluster::new(vec!["node-1".into()]);
//! let engine = Engine::new(cluster, transport, GossipConfig::default());
//! engine.start()?;
//! ```

pub mod arbiter;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod leaving;
pub mod metrics;
pub mod protocol;
pub mod reactor;
pub mod suspicion;
pub mod tag;
pub mod transport;

pub use arbiter::Arbiter;
pub use config::{GossipConfig, DEFAULT_SWIM_TAG_KEY};
pub use engine::Engine;
pub use error::{GossipError, Result};
pub use leaving::LeavingNode;
pub use metrics::{DetectorIncrement, DetectorMetrics, Metrics, StateIncrement, StateMetrics};
pub use protocol::{
    decode_message, encode_message, frame_length, frame_message, GossipMessage, MAX_MESSAGE_SIZE,
};
pub use suspicion::SuspicionQueue;
pub use tag::{SwimState, SwimTag, TagTransaction, TagValidator};
pub use transport::{ChannelTransport, Transport};

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::engine::Engine;
    pub use crate::error::*;
    pub use crate::protocol::GossipMessage;
    pub use crate::tag::{SwimState, SwimTag};
    pub use crate::transport::Transport;
    pub use huddle_store::{Cluster, NodeId};
}
