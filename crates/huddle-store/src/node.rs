//! Node identity, key-value entries, and the per-key validator seam

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

use crate::error::Result;

/// Opaque handle for a cluster member.
///
/// The store assigns handles; everything that needs to reference a node
/// across subsystem boundaries keys by `NodeId` instead of holding the node
/// itself, so auxiliary indices never form reference cycles with the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Raw numeric form, for logging and diagnostics.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw form. Meaningful only for handles that
    /// originated from the same cluster.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A single key-value entry of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Point-in-time copy of a node: its name set and all key-value entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub names: Vec<String>,
    pub kvs: Vec<KeyValue>,
}

/// A staged, single-key mutation created by a [`KvValidator`].
///
/// The store treats the staged value as opaque; concrete models downcast
/// through [`KvTxn::as_any_mut`] to reach their typed operations.
pub trait KvTxn: Send {
    /// The value as it was when the transaction staged this key.
    fn before(&self) -> &str;

    /// Whether any mutation occurred. Sticky once true.
    fn updated(&self) -> bool;

    /// `(updated, encoded value)`. Commit writes the value only when the
    /// flag is set.
    fn after(&self) -> (bool, String);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Per-key data model: validation, remote synchronization, and transaction
/// creation.
pub trait KvValidator: Send + Sync {
    /// Merge a remote entry into the local one. Returns whether the local
    /// value changed. `remote == None` means the remote carries no entry.
    fn sync(&self, entry: &mut KeyValue, remote: Option<&KeyValue>) -> Result<bool>;

    /// Whether a raw entry is acceptable for this key.
    fn validate(&self, kv: &KeyValue) -> bool;

    /// Begin a staged transaction over the current value.
    fn txn(&self, kv: KeyValue) -> Result<Box<dyn KvTxn>>;
}
