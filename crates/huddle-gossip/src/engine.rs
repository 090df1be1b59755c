//! Engine assembly: shared state, store wiring, and the periodic driver
//!
//! The engine owns every auxiliary index of the protocol (outstanding
//! probes, round-trip estimates, the suspicion queue, the region index, and
//! the leaving-member archive) behind one reader/writer lock. The store
//! owns tag values; the engine only changes them inside store transactions,
//! and reacts to committed changes through the pre-commit hook and the
//! tag-key watcher it registers at construction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, warn};

use huddle_store::{Cluster, KeyChange, NodeId, StoreError, Transaction, TxnOp};

use crate::arbiter::Arbiter;
use crate::config::GossipConfig;
use crate::error::Result;
use crate::leaving::LeavingNode;
use crate::metrics::{Metrics, StateIncrement};
use crate::protocol::GossipMessage;
use crate::suspicion::SuspicionQueue;
use crate::tag::{SwimState, SwimTag, TagTransaction, TagValidator};
use crate::transport::Transport;

/// Capacity of each timeout event queue feeding the dispatcher.
const TIMEOUT_QUEUE_CAPACITY: usize = 128;

/// Floor for measured round-trip estimates.
pub(crate) const MIN_ROUND_TRIP: Duration = Duration::from_millis(1);

/// A proxied probe being served through the local probe of its target.
#[derive(Debug, Clone)]
pub(crate) struct ProxyPingRequest {
    /// Names of the member that asked for the indirect probe.
    pub(crate) origin: Vec<String>,
    /// Names of the probed member, as the origin knows them.
    pub(crate) target: Vec<String>,
    /// The origin's correlation id, echoed in the relayed ack.
    pub(crate) id: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PingContextShared {
    pub(crate) proxy_for: Vec<ProxyPingRequest>,
    pub(crate) indirects: u32,
}

/// Bookkeeping for one outstanding probe. At most one per target; removed
/// on ack or on indirect-probe timeout.
#[derive(Debug)]
pub(crate) struct PingContext {
    pub(crate) id: u64,
    pub(crate) start: Instant,
    pub(crate) shared: Mutex<PingContextShared>,
}

/// Everything guarded by the engine lock.
pub(crate) struct EngineState {
    pub(crate) in_ping: HashMap<NodeId, Arc<PingContext>>,
    pub(crate) round_trips: HashMap<NodeId, Duration>,
    pub(crate) suspicions: SuspicionQueue,
    pub(crate) with_region: HashMap<String, HashSet<NodeId>>,
    /// Region of the local member, mirrored from its committed tag.
    pub(crate) region: String,
    pub(crate) leaving_nodes: Vec<Arc<LeavingNode>>,
    pub(crate) leaving_name_index: HashMap<String, usize>,
}

/// SWIM failure-detection and membership-state engine.
pub struct Engine {
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) config: GossipConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) arbiter: Arbiter,
    pub metrics: Metrics,
    pub(crate) state: RwLock<EngineState>,
    inner_txns: DashSet<u64>,
    next_message_id: AtomicU64,
    pub(crate) ping_timeout_tx: mpsc::Sender<NodeId>,
    pub(crate) ping_req_timeout_tx: mpsc::Sender<NodeId>,
    #[allow(clippy::type_complexity)]
    timeout_rx: Mutex<Option<(mpsc::Receiver<NodeId>, mpsc::Receiver<NodeId>)>>,
    pub(crate) weak_self: Weak<Engine>,
}

impl Engine {
    /// Create the engine and wire it into the store: tag validator,
    /// pre-commit hook, and tag-key watcher. [`Engine::start`] brings up the
    /// background loops.
    pub fn new(
        cluster: Arc<Cluster>,
        transport: Arc<dyn Transport>,
        config: GossipConfig,
    ) -> Arc<Self> {
        let (ping_timeout_tx, ping_timeout_rx) = mpsc::channel(TIMEOUT_QUEUE_CAPACITY);
        let (ping_req_timeout_tx, ping_req_timeout_rx) = mpsc::channel(TIMEOUT_QUEUE_CAPACITY);

        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| {
            let mut with_region: HashMap<String, HashSet<NodeId>> = HashMap::new();
            // the local member starts in the empty region until its tag
            // commits the configured one
            with_region
                .entry(String::new())
                .or_default()
                .insert(cluster.self_id());

            Engine {
                cluster: cluster.clone(),
                config,
                transport,
                arbiter: Arbiter::new(),
                metrics: Metrics::default(),
                state: RwLock::new(EngineState {
                    in_ping: HashMap::new(),
                    round_trips: HashMap::new(),
                    suspicions: SuspicionQueue::new(),
                    with_region,
                    region: String::new(),
                    leaving_nodes: Vec::new(),
                    leaving_name_index: HashMap::new(),
                }),
                inner_txns: DashSet::new(),
                next_message_id: AtomicU64::new(1),
                ping_timeout_tx,
                ping_req_timeout_tx,
                timeout_rx: Mutex::new(Some((ping_timeout_rx, ping_req_timeout_rx))),
                weak_self: weak.clone(),
            }
        });

        engine
            .metrics
            .state
            .apply(&StateIncrement { alive: 1, ..Default::default() });

        cluster.register_validator(engine.config.swim_tag_key.clone(), Arc::new(TagValidator));

        let weak = Arc::downgrade(&engine);
        cluster.set_commit_hook(Box::new(
            move |txn: &mut Transaction<'_>, ops: &[TxnOp]| match weak.upgrade() {
                Some(engine) => engine.on_transaction_commit(txn, ops),
                None => Ok(true),
            },
        ));

        let weak = Arc::downgrade(&engine);
        cluster.watch_key(
            engine.config.swim_tag_key.clone(),
            Box::new(move |change: &KeyChange| {
                if let Some(engine) = weak.upgrade() {
                    engine.on_tag_changed(change);
                }
            }),
        );

        engine
    }

    /// Commit the local tag and spawn the timeout dispatcher and the
    /// periodic probe/suspicion loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.claim_self_tag()?;

        if let Some((mut ping_timeout_rx, mut ping_req_timeout_rx)) = self
            .timeout_rx
            .lock()
            .expect("engine lock poisoned")
            .take()
        {
            let engine = Arc::clone(self);
            self.arbiter.spawn(async move {
                loop {
                    tokio::select! {
                        timed_out = ping_timeout_rx.recv() => match timed_out {
                            Some(node) => engine.process_ping_timeout(node),
                            None => break,
                        },
                        timed_out = ping_req_timeout_rx.recv() => match timed_out {
                            Some(node) => engine.process_ping_req_timeout(node),
                            None => break,
                        },
                    }
                }
            });

            self.go_detect_failure();
        }
        Ok(())
    }

    fn go_detect_failure(self: &Arc<Self>) {
        if !self.config.disable_failure_detect {
            let engine = Arc::clone(self);
            self.arbiter.spawn(async move {
                let mut ticker = gossip_ticker(engine.config.gossip_period);
                loop {
                    ticker.tick().await;
                    if !engine.arbiter.should_run() {
                        break;
                    }
                    engine.detect_failure();
                }
            });
        }

        if !self.config.disable_clear_suspicions {
            let engine = Arc::clone(self);
            self.arbiter.spawn(async move {
                let mut ticker = gossip_ticker(engine.config.gossip_period);
                loop {
                    ticker.tick().await;
                    if !engine.arbiter.should_run() {
                        break;
                    }
                    engine.clear_suspicions();
                }
            });
        }
    }

    /// Stop the background loops. Outstanding one-shot timers may still
    /// fire; their handlers tolerate the empty state they find.
    pub fn shutdown(&self) {
        self.arbiter.shutdown();
    }

    /// Mark the local member as LEFT. Terminal; peers will drop the member
    /// regardless of their region floor.
    pub fn leave(&self) -> Result<()> {
        let self_id = self.cluster.self_id();
        self.cluster
            .txn(|t| -> Result<bool> {
                self.mark_internal(t.id());
                let tag = self.tag_txn(t, self_id)?;
                Ok(tag.leave())
            })
            .map(|_| ())
    }

    /// Region of the local member, as last committed.
    pub fn region(&self) -> String {
        self.read_state().region.clone()
    }

    pub(crate) fn generate_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Flag a transaction as engine-initiated before it commits.
    pub(crate) fn mark_internal(&self, txn_id: u64) {
        self.inner_txns.insert(txn_id);
    }

    /// Consume the engine-initiated flag for a committing transaction.
    pub(crate) fn take_internal(&self, txn_id: u64) -> bool {
        self.inner_txns.remove(&txn_id).is_some()
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().expect("engine state lock poisoned")
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().expect("engine state lock poisoned")
    }

    pub(crate) fn send_message(&self, to: &[String], message: GossipMessage) {
        self.transport.send(to, message);
    }

    /// The staged tag transaction for `node`, creating it on first access.
    pub(crate) fn tag_txn<'a>(
        &self,
        txn: &'a mut Transaction<'_>,
        node: NodeId,
    ) -> huddle_store::Result<&'a mut TagTransaction> {
        let key = self.config.swim_tag_key.clone();
        let kv = txn.kv(node, &key)?;
        kv.as_any_mut()
            .downcast_mut::<TagTransaction>()
            .ok_or(StoreError::InvalidKeyValue(key))
    }

    /// Round-trip estimate used for probe timeouts. Pinned to the gossip
    /// period unless measured estimates are enabled.
    pub(crate) fn estimated_round_trip(&self, state: &EngineState, node: NodeId) -> Duration {
        if self.config.use_estimated_rtt {
            if let Some(rtt) = state.round_trips.get(&node) {
                if !rtt.is_zero() {
                    return (*rtt).max(MIN_ROUND_TRIP);
                }
            }
        }
        self.config.gossip_period
    }

    /// Write the configured region and an ALIVE claim into the local tag.
    /// Runs at startup and whenever the local tag goes missing.
    pub(crate) fn claim_self_tag(&self) -> Result<()> {
        let self_id = self.cluster.self_id();
        self.cluster
            .txn(|t| -> Result<bool> {
                self.mark_internal(t.id());
                let tag = self.tag_txn(t, self_id)?;
                tag.set_region(&self.config.region);
                tag.claim_alive();
                Ok(true)
            })
            .map(|_| ())
    }

    /// React to a committed tag change anywhere in the cluster.
    pub(crate) fn on_tag_changed(&self, change: &KeyChange) {
        let self_id = self.cluster.self_id();
        let Some(value) = change.new.as_deref() else {
            // the tag was deleted; the local member restores its own
            if change.node == self_id {
                if let Err(e) = self.claim_self_tag() {
                    error!(error = %e, "failed to restore local SWIM tag");
                }
            }
            return;
        };

        let tag = match SwimTag::decode_stored(value) {
            Ok(tag) => tag,
            Err(e) => {
                warn!(node = %change.node, error = %e, "ignoring undecodable SWIM tag update");
                return;
            }
        };

        if change.node == self_id {
            self.on_self_state_changed(&tag);
        } else if matches!(tag.state, SwimState::Dead | SwimState::Left) {
            self.remove_if_dead_or_left(change.node, &tag);
        }
    }

    /// Refute false positives about the local member. A deliberate LEFT is
    /// not refuted.
    fn on_self_state_changed(&self, tag: &SwimTag) {
        if !matches!(tag.state, SwimState::Suspected | SwimState::Dead) {
            return;
        }
        let self_id = self.cluster.self_id();
        if let Err(e) = self.cluster.txn(|t| -> Result<bool> {
            self.mark_internal(t.id());
            let tag = self.tag_txn(t, self_id)?;
            Ok(tag.claim_alive())
        }) {
            error!(error = %e, "failed to refute suspicion about the local member");
        }
    }
}

fn gossip_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    #[tokio::test]
    async fn test_self_tag_bootstrap() {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, _rx) = ChannelTransport::new();
        let config = GossipConfig::default().with_region("rack-a");
        let engine = Engine::new(cluster.clone(), transport, config);
        engine.start().unwrap();

        let value = cluster
            .value(cluster.self_id(), crate::config::DEFAULT_SWIM_TAG_KEY)
            .unwrap();
        let tag = SwimTag::decode(&value).unwrap();
        assert_eq!(tag.state, SwimState::Alive);
        assert_eq!(tag.region, "rack-a");

        // the reactor moved the local member into its committed region
        assert_eq!(engine.region(), "rack-a");
        let state = engine.read_state();
        assert!(state.with_region["rack-a"].contains(&cluster.self_id()));
        assert!(!state.with_region.contains_key(""));
        drop(state);

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_self_refutes_suspicion() {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, _rx) = ChannelTransport::new();
        let engine = Engine::new(cluster.clone(), transport, GossipConfig::default());
        let self_id = cluster.self_id();

        // a peer's gossip claims the local member suspected
        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, self_id)?;
                tag.claim_suspected();
                Ok(true)
            })
            .unwrap();

        // the watcher committed a correction with a bumped version
        let value = cluster
            .value(self_id, crate::config::DEFAULT_SWIM_TAG_KEY)
            .unwrap();
        let tag = SwimTag::decode(&value).unwrap();
        assert_eq!(tag.state, SwimState::Alive);
        assert_eq!(tag.version, 1);
    }

    #[tokio::test]
    async fn test_leave_is_not_refuted() {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, _rx) = ChannelTransport::new();
        let engine = Engine::new(cluster.clone(), transport, GossipConfig::default());

        engine.leave().unwrap();

        let value = cluster
            .value(cluster.self_id(), crate::config::DEFAULT_SWIM_TAG_KEY)
            .unwrap();
        assert_eq!(SwimTag::decode(&value).unwrap().state, SwimState::Left);
    }

    #[tokio::test]
    async fn test_deleted_self_tag_restored() {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, _rx) = ChannelTransport::new();
        let config = GossipConfig::default().with_region("rack-a");
        let engine = Engine::new(cluster.clone(), transport, config);
        engine.start().unwrap();
        let self_id = cluster.self_id();

        cluster
            .txn(|t| -> Result<bool> {
                t.delete(self_id, crate::config::DEFAULT_SWIM_TAG_KEY)?;
                Ok(true)
            })
            .unwrap();

        let value = cluster
            .value(self_id, crate::config::DEFAULT_SWIM_TAG_KEY)
            .unwrap();
        assert_eq!(SwimTag::decode(&value).unwrap().region, "rack-a");
        engine.shutdown();
    }
}
