//! Cluster state: named members, per-key values, transactions, hooks

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::error::{Result, StoreError};
use crate::node::{KvValidator, NodeId};
use crate::txn::{Transaction, TxnOp, TxnOptions};

/// A committed change to one key of one node, delivered to key watchers
/// after the transaction has been applied.
#[derive(Debug, Clone)]
pub struct KeyChange {
    pub node: NodeId,
    pub key: String,
    /// `None` when the entry did not exist before.
    pub old: Option<String>,
    /// `None` when the entry was deleted.
    pub new: Option<String>,
}

/// Post-commit observer for a single key.
pub type KeyWatcher = Box<dyn Fn(&KeyChange) + Send + Sync>;

/// Pre-commit hook: inspects the transaction and its op list, may stage
/// further reads and defer post-commit work. Returning `Ok(false)` or an
/// error fails the transaction.
pub type CommitHook =
    Box<dyn Fn(&mut Transaction<'_>, &[TxnOp]) -> Result<bool> + Send + Sync>;

#[derive(Debug, Default)]
pub(crate) struct NodeRecord {
    pub(crate) names: Vec<String>,
    pub(crate) kvs: BTreeMap<String, String>,
}

#[derive(Default)]
pub(crate) struct ClusterState {
    pub(crate) nodes: HashMap<NodeId, NodeRecord>,
    pub(crate) name_index: HashMap<String, NodeId>,
}

/// The membership store: a set of named nodes, each carrying string-valued
/// entries governed by per-key validators.
///
/// All mutation goes through [`Cluster::txn`] / [`Cluster::membership_txn`].
/// One state lock serializes transactions; deferred callbacks and key
/// watchers run after it is released, so they are free to open follow-up
/// transactions.
pub struct Cluster {
    state: RwLock<ClusterState>,
    validators: RwLock<HashMap<String, Arc<dyn KvValidator>>>,
    watchers: RwLock<Vec<(String, KeyWatcher)>>,
    commit_hook: RwLock<Option<CommitHook>>,
    next_node: AtomicU64,
    next_txn: AtomicU64,
    self_id: NodeId,
}

impl Cluster {
    /// Create a cluster whose only member is the local node.
    pub fn new(self_names: Vec<String>) -> Arc<Self> {
        let mut names = self_names;
        names.sort();
        names.dedup();

        let self_id = NodeId(0);
        let mut state = ClusterState::default();
        for name in &names {
            state.name_index.insert(name.clone(), self_id);
        }
        state.nodes.insert(
            self_id,
            NodeRecord {
                names,
                kvs: BTreeMap::new(),
            },
        );

        Arc::new(Self {
            state: RwLock::new(state),
            validators: RwLock::new(HashMap::new()),
            watchers: RwLock::new(Vec::new()),
            commit_hook: RwLock::new(None),
            next_node: AtomicU64::new(1),
            next_txn: AtomicU64::new(1),
            self_id,
        })
    }

    /// Handle of the local node.
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Register the data model for a key. Replaces any previous validator.
    pub fn register_validator(&self, key: impl Into<String>, validator: Arc<dyn KvValidator>) {
        self.validators
            .write()
            .expect("validator lock poisoned")
            .insert(key.into(), validator);
    }

    /// Install the pre-commit hook. At most one hook is active.
    pub fn set_commit_hook(&self, hook: CommitHook) {
        *self.commit_hook.write().expect("hook lock poisoned") = Some(hook);
    }

    /// Observe committed changes of one key across all nodes.
    pub fn watch_key(&self, key: impl Into<String>, watcher: KeyWatcher) {
        self.watchers
            .write()
            .expect("watcher lock poisoned")
            .push((key.into(), watcher));
    }

    pub(crate) fn validator(&self, key: &str) -> Option<Arc<dyn KvValidator>> {
        self.validators
            .read()
            .expect("validator lock poisoned")
            .get(key)
            .cloned()
    }

    pub(crate) fn allocate_node_id(&self) -> NodeId {
        NodeId(self.next_node.fetch_add(1, Ordering::Relaxed))
    }

    /// All member handles, self included.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let state = self.state.read().expect("state lock poisoned");
        let mut ids: Vec<NodeId> = state.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.state.read().expect("state lock poisoned").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the member exists.
    pub fn contains(&self, node: NodeId) -> bool {
        self.state
            .read()
            .expect("state lock poisoned")
            .nodes
            .contains_key(&node)
    }

    /// Name set of a member.
    pub fn names(&self, node: NodeId) -> Option<Vec<String>> {
        self.state
            .read()
            .expect("state lock poisoned")
            .nodes
            .get(&node)
            .map(|rec| rec.names.clone())
    }

    /// Committed value of one entry.
    pub fn value(&self, node: NodeId, key: &str) -> Option<String> {
        self.state
            .read()
            .expect("state lock poisoned")
            .nodes
            .get(&node)
            .and_then(|rec| rec.kvs.get(key).cloned())
    }

    /// Resolve a name set to the member matching the most names. Ties break
    /// toward the oldest member.
    pub fn most_possible_node(&self, names: &[String]) -> Option<NodeId> {
        let state = self.state.read().expect("state lock poisoned");
        let mut votes: HashMap<NodeId, usize> = HashMap::new();
        for name in names {
            if let Some(id) = state.name_index.get(name) {
                *votes.entry(*id).or_default() += 1;
            }
        }
        votes
            .into_iter()
            .max_by_key(|&(id, count)| (count, std::cmp::Reverse(id)))
            .map(|(id, _)| id)
    }

    /// Run a transaction without membership modification rights.
    pub fn txn<E, F>(&self, f: F) -> std::result::Result<bool, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<bool, E>,
        E: From<StoreError>,
    {
        self.txn_with(TxnOptions::default(), f)
    }

    /// Run a transaction that may insert and remove members.
    pub fn membership_txn<E, F>(&self, f: F) -> std::result::Result<bool, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<bool, E>,
        E: From<StoreError>,
    {
        self.txn_with(TxnOptions { membership: true }, f)
    }

    fn txn_with<E, F>(&self, options: TxnOptions, f: F) -> std::result::Result<bool, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<bool, E>,
        E: From<StoreError>,
    {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.state.write().expect("state lock poisoned");

        let mut txn = Transaction {
            cluster: self,
            state: &mut *guard,
            id,
            membership: options.membership,
            staged: HashMap::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            deleted: Vec::new(),
            deferred: Vec::new(),
            ops: Vec::new(),
        };

        let changed = f(&mut txn)?;
        if !changed {
            return Ok(false);
        }

        let ops = txn.ops.clone();
        {
            let hook_guard = self.commit_hook.read().expect("hook lock poisoned");
            if let Some(hook) = hook_guard.as_ref() {
                let accepted = hook(&mut txn, &ops).map_err(E::from)?;
                if !accepted {
                    return Err(E::from(StoreError::Rejected));
                }
            }
        }

        let Transaction {
            mut staged,
            inserted,
            removed,
            deleted,
            deferred,
            ..
        } = txn;

        let mut events: Vec<KeyChange> = Vec::new();

        for (id, names) in &inserted {
            for name in names {
                guard.name_index.insert(name.clone(), *id);
            }
            guard.nodes.insert(
                *id,
                NodeRecord {
                    names: names.clone(),
                    kvs: BTreeMap::new(),
                },
            );
        }

        for op in &ops {
            let TxnOp::KeyUpdate { node, key } = op else {
                continue;
            };
            let Some(kv_txn) = staged.remove(&(*node, key.clone())) else {
                continue;
            };
            let (updated, after) = kv_txn.after();
            if !updated || removed.contains(node) {
                continue;
            }
            if let Some(rec) = guard.nodes.get_mut(node) {
                let old = rec.kvs.insert(key.clone(), after.clone());
                events.push(KeyChange {
                    node: *node,
                    key: key.clone(),
                    old,
                    new: Some(after),
                });
            }
        }

        for (node, key) in &deleted {
            if removed.contains(node) {
                continue;
            }
            if let Some(rec) = guard.nodes.get_mut(node) {
                if let Some(old) = rec.kvs.remove(key) {
                    events.push(KeyChange {
                        node: *node,
                        key: key.clone(),
                        old: Some(old),
                        new: None,
                    });
                }
            }
        }

        for node in &removed {
            if let Some(rec) = guard.nodes.remove(node) {
                for name in rec.names {
                    guard.name_index.remove(&name);
                }
            }
        }

        drop(guard);

        trace!(txn = id, ops = ops.len(), "transaction committed");

        for callback in deferred {
            callback();
        }
        self.emit_key_events(&events);

        Ok(true)
    }

    fn emit_key_events(&self, events: &[KeyChange]) {
        if events.is_empty() {
            return;
        }
        let watchers = self.watchers.read().expect("watcher lock poisoned");
        for event in events {
            for (key, watcher) in watchers.iter() {
                if key == &event.key {
                    watcher(event);
                }
            }
        }
    }
}
