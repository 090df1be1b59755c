//! # Huddle Store
//!
//! The transactional membership key-value store behind the huddle gossip
//! engine. Members are sets of names; each member carries string-valued
//! entries governed by per-key validators.
//!
//! Facilities:
//! - **Transactions**: staged mutation with snapshot reads and conditional
//!   commit; `membership_txn` additionally permits member insertion/removal
//! - **Pre-commit hook**: a single registered hook inspects every
//!   transaction's op list and can veto it or defer post-commit work
//! - **Key watchers**: committed per-key changes delivered after the state
//!   lock is released
//! - **Name resolution**: [`Cluster::most_possible_node`] maps a name set to
//!   the best-matching member

pub mod cluster;
pub mod error;
pub mod node;
pub mod txn;

pub use cluster::{Cluster, CommitHook, KeyChange, KeyWatcher};
pub use error::{Result, StoreError};
pub use node::{KeyValue, KvTxn, KvValidator, NodeId, NodeSnapshot};
pub use txn::{Transaction, TxnOp, TxnOptions};
