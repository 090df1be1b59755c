//! Staged transactions over cluster state

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::cluster::{Cluster, ClusterState};
use crate::error::{Result, StoreError};
use crate::node::{KeyValue, KvTxn, NodeId, NodeSnapshot};

/// Operations a transaction performed, in order, as seen by the pre-commit
/// hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// A node was inserted into the membership.
    NodeAdded(NodeId),
    /// A node was removed from the membership.
    NodeRemoved(NodeId),
    /// A key was staged for this node. The staged model may or may not have
    /// been mutated; inspect the key transaction's `updated()`.
    KeyUpdate { node: NodeId, key: String },
    /// A key was deleted from this node.
    KeyDeleted { node: NodeId, key: String },
}

/// Transaction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    /// Permit node insertion and removal.
    pub membership: bool,
}

/// A staged mutation of cluster state.
///
/// Nothing is visible outside the transaction until commit. The commit
/// pipeline runs the registered pre-commit hook over the op list, applies
/// staged values whose key transactions report a change, then runs deferred
/// callbacks and key watchers after the state lock is released.
pub struct Transaction<'c> {
    pub(crate) cluster: &'c Cluster,
    pub(crate) state: &'c mut ClusterState,
    pub(crate) id: u64,
    pub(crate) membership: bool,
    pub(crate) staged: HashMap<(NodeId, String), Box<dyn KvTxn>>,
    pub(crate) inserted: Vec<(NodeId, Vec<String>)>,
    pub(crate) removed: Vec<NodeId>,
    pub(crate) deleted: Vec<(NodeId, String)>,
    pub(crate) deferred: Vec<Box<dyn FnOnce() + Send>>,
    pub(crate) ops: Vec<TxnOp>,
}

impl<'c> Transaction<'c> {
    /// Transaction identifier, unique within the cluster's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn node_known(&self, node: NodeId) -> bool {
        self.state.nodes.contains_key(&node) || self.inserted.iter().any(|(id, _)| *id == node)
    }

    /// Stage (or return the already-staged) key transaction for `node`/`key`.
    ///
    /// The key transaction is created by the key's registered validator from
    /// the committed value; a missing entry stages from the empty string.
    pub fn kv(&mut self, node: NodeId, key: &str) -> Result<&mut dyn KvTxn> {
        if !self.node_known(node) {
            return Err(StoreError::NodeNotFound);
        }
        match self.staged.entry((node, key.to_string())) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut().as_mut()),
            Entry::Vacant(vacant) => {
                let validator = self
                    .cluster
                    .validator(key)
                    .ok_or_else(|| StoreError::ValidatorMissing(key.to_string()))?;
                let value = self
                    .state
                    .nodes
                    .get(&node)
                    .and_then(|rec| rec.kvs.get(key))
                    .cloned()
                    .unwrap_or_default();
                let kv_txn = validator.txn(KeyValue::new(key, value))?;
                self.ops.push(TxnOp::KeyUpdate {
                    node,
                    key: key.to_string(),
                });
                Ok(vacant.insert(kv_txn).as_mut())
            }
        }
    }

    /// Delete a key from a node.
    pub fn delete(&mut self, node: NodeId, key: &str) -> Result<()> {
        if !self.node_known(node) {
            return Err(StoreError::NodeNotFound);
        }
        self.staged.remove(&(node, key.to_string()));
        self.deleted.push((node, key.to_string()));
        self.ops.push(TxnOp::KeyDeleted {
            node,
            key: key.to_string(),
        });
        Ok(())
    }

    /// Insert a new member with the given names. Requires membership mode.
    pub fn insert_node(&mut self, names: Vec<String>) -> Result<NodeId> {
        if !self.membership {
            return Err(StoreError::MembershipDenied);
        }
        let mut names = names;
        names.sort();
        names.dedup();
        for name in &names {
            let bound = self.state.name_index.contains_key(name)
                || self
                    .inserted
                    .iter()
                    .any(|(_, staged)| staged.iter().any(|n| n == name));
            if bound {
                return Err(StoreError::NameConflict(name.clone()));
            }
        }
        let id = self.cluster.allocate_node_id();
        self.inserted.push((id, names));
        self.ops.push(TxnOp::NodeAdded(id));
        Ok(id)
    }

    /// Remove a member. Requires membership mode.
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        if !self.membership {
            return Err(StoreError::MembershipDenied);
        }
        if !self.node_known(node) {
            return Err(StoreError::NodeNotFound);
        }
        if !self.removed.contains(&node) {
            self.removed.push(node);
            self.ops.push(TxnOp::NodeRemoved(node));
        }
        Ok(())
    }

    /// Name set of a node as of the committed state (staged inserts
    /// included).
    pub fn names(&self, node: NodeId) -> Result<Vec<String>> {
        if let Some(rec) = self.state.nodes.get(&node) {
            return Ok(rec.names.clone());
        }
        self.inserted
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, names)| names.clone())
            .ok_or(StoreError::NodeNotFound)
    }

    /// Read a committed snapshot of a node: names plus all entries.
    pub fn read_node_snapshot(&self, node: NodeId) -> Result<NodeSnapshot> {
        if let Some(rec) = self.state.nodes.get(&node) {
            return Ok(NodeSnapshot {
                names: rec.names.clone(),
                kvs: rec
                    .kvs
                    .iter()
                    .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
                    .collect(),
            });
        }
        if self.inserted.iter().any(|(id, _)| *id == node) {
            return Ok(NodeSnapshot {
                names: self.names(node)?,
                kvs: Vec::new(),
            });
        }
        Err(StoreError::NodeNotFound)
    }

    /// Run a callback after the commit has been applied and the state lock
    /// released. Callbacks run in registration order; an aborted transaction
    /// drops them unrun.
    pub fn defer_on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(f));
    }
}
