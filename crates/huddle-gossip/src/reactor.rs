//! Reaction to committed membership transactions
//!
//! A pre-commit hook classifies every transaction's operations (member
//! insertions and removals, tag state changes, tag region changes) and
//! defers the index and tally maintenance to run once the commit has been
//! applied: region index upkeep, state tallies, suspicion tracing, and
//! purging removed members from the failure detector. Expired suspicions
//! are promoted to DEAD claims; DEAD members are swept out of
//! over-populated regions; a member whose tag commits DEAD or LEFT is
//! removed outright when its region can spare it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use huddle_store::{KvTxn, NodeId, Transaction, TxnOp};

use crate::engine::{Engine, EngineState};
use crate::error::Result;
use crate::leaving::LeavingNode;
use crate::metrics::{DetectorIncrement, StateIncrement};
use crate::tag::{SwimState, SwimTag};

/// Delay before retrying a failed dead-member sweep.
const CLEAR_DEADS_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeChange {
    Added,
    Removed,
    TagTouched,
    /// Inserted and removed within the same transaction; nothing to track.
    Annulled,
}

fn tally(inc: &mut StateIncrement, state: SwimState, delta: i64) {
    match state {
        SwimState::Alive => inc.alive += delta,
        SwimState::Suspected => inc.suspected += delta,
        SwimState::Dead => inc.dead += delta,
        SwimState::Left => inc.left += delta,
    }
}

impl Engine {
    /// Pre-commit hook over every store transaction.
    pub(crate) fn on_transaction_commit(
        &self,
        txn: &mut Transaction<'_>,
        ops: &[TxnOp],
    ) -> huddle_store::Result<bool> {
        let is_engine_txn = self.take_internal(txn.id());
        debug!(
            txn = txn.id(),
            engine_txn = is_engine_txn,
            ops = ops.len(),
            "inspecting transaction before commit"
        );
        self.update_engine_related_fields(txn, ops)
    }

    fn update_engine_related_fields(
        &self,
        txn: &mut Transaction<'_>,
        ops: &[TxnOp],
    ) -> huddle_store::Result<bool> {
        let tag_key = self.config.swim_tag_key.as_str();

        // classify the touched members; a membership op outranks a tag
        // touch, and an insert annulled by a removal in the same
        // transaction never materializes
        let mut changes: Vec<(NodeId, NodeChange)> = Vec::new();
        let mut seen: HashMap<NodeId, usize> = HashMap::new();
        for op in ops {
            let (node, change) = match op {
                TxnOp::NodeAdded(node) => (*node, NodeChange::Added),
                TxnOp::NodeRemoved(node) => (*node, NodeChange::Removed),
                TxnOp::KeyUpdate { node, key } if key == tag_key => {
                    (*node, NodeChange::TagTouched)
                }
                _ => continue,
            };
            if let Some(&at) = seen.get(&node) {
                match (changes[at].1, change) {
                    (NodeChange::Added, NodeChange::Removed) => {
                        changes[at].1 = NodeChange::Annulled;
                    }
                    (NodeChange::TagTouched, NodeChange::Added | NodeChange::Removed) => {
                        changes[at].1 = change;
                    }
                    _ => {}
                }
            } else {
                seen.insert(node, changes.len());
                changes.push((node, change));
            }
        }
        if changes.is_empty() {
            return Ok(true);
        }

        let self_id = self.cluster.self_id();
        let mut state_inc = StateIncrement::default();
        let mut insertions: Vec<(NodeId, String)> = Vec::new();
        let mut deletions: Vec<(NodeId, String)> = Vec::new();
        let mut region_moves: Vec<(NodeId, String, String)> = Vec::new();
        let mut state_updates: Vec<(NodeId, SwimState)> = Vec::new();
        let mut self_region: Option<String> = None;

        for (node, change) in changes {
            if change == NodeChange::Annulled {
                continue;
            }
            let tag = self.tag_txn(txn, node)?;
            let old_tag = SwimTag::decode_stored(tag.before()).map_err(|e| {
                error!(node = %node, error = %e, "failed to decode committed SWIM tag");
                huddle_store::StoreError::Decode(e.to_string())
            })?;

            match change {
                NodeChange::Added => {
                    insertions.push((node, tag.region().to_string()));
                    tally(&mut state_inc, tag.state(), 1);
                }
                NodeChange::Removed => {
                    deletions.push((node, tag.region().to_string()));
                    tally(&mut state_inc, tag.state(), -1);
                }
                NodeChange::TagTouched => {
                    if !tag.updated() {
                        continue;
                    }
                    if tag.region() != old_tag.region {
                        region_moves.push((
                            node,
                            old_tag.region.clone(),
                            tag.region().to_string(),
                        ));
                        if node == self_id {
                            self_region = Some(tag.region().to_string());
                        }
                    }
                    if tag.state() != old_tag.state {
                        state_updates.push((node, tag.state()));
                        tally(&mut state_inc, old_tag.state, -1);
                        tally(&mut state_inc, tag.state(), 1);
                    }
                }
                NodeChange::Annulled => unreachable!("filtered out above"),
            }
        }

        let weak = self.weak_self.clone();
        txn.defer_on_commit(move || {
            let Some(engine) = weak.upgrade() else {
                return;
            };
            engine.metrics.state.apply(&state_inc);

            if insertions.is_empty()
                && deletions.is_empty()
                && region_moves.is_empty()
                && state_updates.is_empty()
                && self_region.is_none()
            {
                return;
            }

            let mut detector_inc = DetectorIncrement::default();
            {
                let mut state = engine.write_state();
                if let Some(region) = self_region {
                    state.region = region;
                }
                for (node, region) in insertions {
                    state.with_region.entry(region).or_default().insert(node);
                }
                for (node, region) in deletions {
                    remove_from_region(&mut state, &region, node);
                    engine.clear_node_from_failure_detector(&mut state, node, &mut detector_inc);
                }
                for (node, old_region, new_region) in region_moves {
                    remove_from_region(&mut state, &old_region, node);
                    state
                        .with_region
                        .entry(new_region)
                        .or_default()
                        .insert(node);
                }
                for (node, new_state) in state_updates {
                    engine.trace_suspicions(&mut state, node, new_state);
                }
            }
            engine.metrics.failure_detector.apply(&detector_inc);
        });

        Ok(true)
    }

    /// Drop every trace of a removed member from the failure detector:
    /// its outstanding probe (settling queued proxied probes as failures),
    /// its round-trip record, and its suspicion.
    pub(crate) fn clear_node_from_failure_detector(
        &self,
        state: &mut EngineState,
        node: NodeId,
        inc: &mut DetectorIncrement,
    ) {
        if let Some(context) = state.in_ping.remove(&node) {
            let shared = context.shared.lock().expect("ping context lock poisoned");
            if shared.indirects > 0 {
                inc.ping_indirect -= i64::from(shared.indirects);
            }
            if !shared.proxy_for.is_empty() {
                inc.proxy_failure += shared.proxy_for.len() as u64;
            }
            inc.ping -= 1;
        }
        state.round_trips.remove(&node);
        state.suspicions.remove(node);
    }

    /// Keep the suspicion queue in step with a member's committed state.
    pub(crate) fn trace_suspicions(
        &self,
        state: &mut EngineState,
        node: NodeId,
        new_state: SwimState,
    ) {
        if new_state != SwimState::Suspected {
            state.suspicions.remove(node);
        } else if !state.suspicions.contains(node) {
            state
                .suspicions
                .push(node, Instant::now() + self.config.gossip_period * 10);
        }
    }

    /// Promote every expired suspicion to a DEAD claim. One round of the
    /// suspicion loop; a commit failure aborts the rest of the batch.
    pub fn clear_suspicions(&self) {
        if !self.arbiter.should_run() {
            return;
        }

        let expired = {
            let mut state = self.write_state();
            if state.suspicions.is_empty() {
                return;
            }
            let now = Instant::now();
            match state.suspicions.peek_min() {
                Some((_, not_after)) if not_after < now => state.suspicions.pop_expired(now),
                _ => return,
            }
        };

        for node in expired {
            let result = self.cluster.txn(|t| -> Result<bool> {
                self.mark_internal(t.id());
                let tag = self.tag_txn(t, node)?;
                Ok(tag.claim_dead())
            });
            if let Err(e) = result {
                error!(node = %node, error = %e, "failed to commit dead claim; aborting batch");
                break;
            }
        }
    }

    /// Sweep DEAD members out of every region holding more members than
    /// the configured floor. Retries in the background on commit failure.
    pub fn clear_deads(&self) {
        let result = self.cluster.membership_txn(|t| -> Result<bool> {
            self.mark_internal(t.id());

            let regions: Vec<Vec<NodeId>> = {
                let state = self.read_state();
                state
                    .with_region
                    .values()
                    .map(|members| {
                        let mut members: Vec<NodeId> = members.iter().copied().collect();
                        members.sort();
                        members
                    })
                    .collect()
            };

            let mut changed = false;
            for members in regions {
                if members.len() <= self.config.min_region_peer {
                    continue;
                }
                let mut allows = members.len() - self.config.min_region_peer;
                for node in members {
                    if allows < 1 {
                        break;
                    }
                    let is_dead = match self.tag_txn(t, node) {
                        Ok(tag) => tag.state() == SwimState::Dead,
                        Err(e) => {
                            warn!(node = %node, error = %e, "cannot read SWIM tag; skipping");
                            continue;
                        }
                    };
                    if is_dead {
                        t.remove_node(node)?;
                        changed = true;
                        allows -= 1;
                    }
                }
            }
            Ok(changed)
        });

        if let Err(e) = result {
            error!(error = %e, "failed to sweep dead members; retrying later");
            self.delay_clear_deads(CLEAR_DEADS_RETRY_DELAY);
        }
    }

    fn delay_clear_deads(&self, delay: Duration) {
        let weak = self.weak_self.clone();
        self.arbiter.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = weak.upgrade() {
                if engine.arbiter.should_run() {
                    engine.clear_deads();
                }
            }
        });
    }

    /// Remove a member whose tag committed DEAD or LEFT. LEFT members go
    /// unconditionally; DEAD members only while their region stays above
    /// the floor. The removed member's identity and entries are archived
    /// so late gossip about it can be recognized.
    pub fn remove_if_dead_or_left(&self, node: NodeId, tag: &SwimTag) {
        if tag.state != SwimState::Dead && tag.state != SwimState::Left {
            return;
        }
        if node == self.cluster.self_id() {
            return;
        }

        let mut leaving: Option<LeavingNode> = None;
        let result = self.cluster.membership_txn(|t| -> Result<bool> {
            self.mark_internal(t.id());

            let removable = {
                let state = self.read_state();
                match state.with_region.get(&tag.region) {
                    None => {
                        error!(node = %node, region = %tag.region,
                            "region set missing for member; removing anyway");
                        true
                    }
                    Some(members) if !members.contains(&node) => {
                        error!(node = %node, region = %tag.region,
                            "member missing from its region set; removing anyway");
                        true
                    }
                    Some(members) => {
                        tag.state == SwimState::Left
                            || members.len() > self.config.min_region_peer
                    }
                }
            };
            if !removable {
                return Ok(false);
            }

            let names = t.names(node)?;
            let snapshot = t.read_node_snapshot(node)?;
            leaving = Some(LeavingNode::new(names, snapshot));
            t.remove_node(node)?;
            Ok(true)
        });

        match result {
            Err(e) => {
                warn!(node = %node, state = %tag.state, error = %e,
                    "failed to remove member; commit failure");
            }
            Ok(true) => {
                if let Some(leaving) = leaving {
                    self.trace_leaving_node(leaving);
                }
            }
            Ok(false) => {}
        }
    }
}

fn remove_from_region(state: &mut EngineState, region: &str, node: NodeId) {
    match state.with_region.get_mut(region) {
        Some(members) => {
            if !members.remove(&node) {
                error!(node = %node, region, "member missing from its region set");
            }
            if members.is_empty() {
                state.with_region.remove(region);
            }
        }
        None => error!(node = %node, region, "region set missing for member"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GossipConfig, DEFAULT_SWIM_TAG_KEY};
    use crate::protocol::GossipMessage;
    use crate::transport::ChannelTransport;
    use huddle_store::Cluster;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    type Outbox = mpsc::UnboundedReceiver<(Vec<String>, GossipMessage)>;

    fn harness(config: GossipConfig) -> (Arc<Engine>, Arc<Cluster>, Outbox) {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, outbox) = ChannelTransport::new();
        let engine = Engine::new(cluster.clone(), transport, config);
        (engine, cluster, outbox)
    }

    fn insert_peer(
        engine: &Engine,
        cluster: &Cluster,
        name: &str,
        region: &str,
        state: SwimState,
    ) -> NodeId {
        cluster
            .membership_txn(|t| -> Result<bool> {
                let id = t.insert_node(vec![name.to_string()])?;
                let tag = engine.tag_txn(t, id)?;
                tag.set_region(region);
                match state {
                    SwimState::Alive => {}
                    SwimState::Suspected => {
                        tag.claim_suspected();
                    }
                    SwimState::Dead => {
                        tag.claim_dead();
                    }
                    SwimState::Left => {
                        tag.leave();
                    }
                }
                Ok(true)
            })
            .unwrap();
        cluster.most_possible_node(&[name.to_string()]).unwrap()
    }

    fn committed_state(cluster: &Cluster, node: NodeId) -> Option<SwimState> {
        cluster
            .value(node, DEFAULT_SWIM_TAG_KEY)
            .and_then(|value| SwimTag::decode_stored(&value).ok())
            .map(|tag| tag.state)
    }

    #[tokio::test]
    async fn test_insertions_feed_region_index_and_tallies() {
        let (engine, cluster, _outbox) = harness(GossipConfig::default());
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);
        let c = insert_peer(&engine, &cluster, "c", "r2", SwimState::Alive);

        let state = engine.read_state();
        assert!(state.with_region["r1"].contains(&b));
        assert!(state.with_region["r2"].contains(&c));
        drop(state);

        // self plus the two peers
        assert_eq!(engine.metrics.state.alive(), 3);
    }

    #[tokio::test]
    async fn test_region_move_follows_committed_tag() {
        let (engine, cluster, _outbox) = harness(GossipConfig::default());
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);

        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                tag.set_region("r2");
                Ok(true)
            })
            .unwrap();

        let state = engine.read_state();
        assert!(!state.with_region.contains_key("r1"));
        assert!(state.with_region["r2"].contains(&b));
    }

    #[tokio::test]
    async fn test_state_change_traces_suspicion() {
        let (engine, cluster, _outbox) = harness(GossipConfig::default());
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);

        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                tag.claim_suspected();
                Ok(true)
            })
            .unwrap();
        assert!(engine.read_state().suspicions.contains(b));
        assert_eq!(engine.metrics.state.suspected(), 1);

        // refutation drops the suspicion again
        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                Ok(tag.claim_alive())
            })
            .unwrap();
        assert!(!engine.read_state().suspicions.contains(b));
        assert_eq!(engine.metrics.state.suspected(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_suspicions_promotes_expired_to_dead() {
        // floor high enough that the dead member is not removed afterwards
        let config = GossipConfig::default().with_min_region_peer(8);
        let (engine, cluster, _outbox) = harness(config);
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);

        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                tag.claim_suspected();
                Ok(true)
            })
            .unwrap();

        // an unexpired suspicion stays put
        engine.clear_suspicions();
        assert_eq!(committed_state(&cluster, b), Some(SwimState::Suspected));

        tokio::time::advance(engine.config.gossip_period * 10 + Duration::from_millis(1)).await;
        engine.clear_suspicions();

        assert_eq!(committed_state(&cluster, b), Some(SwimState::Dead));
        assert!(!engine.read_state().suspicions.contains(b));
        assert_eq!(engine.metrics.state.dead(), 1);
        assert_eq!(engine.metrics.state.suspected(), 0);
    }

    #[tokio::test]
    async fn test_clear_deads_honors_region_floor() {
        let config = GossipConfig::default().with_min_region_peer(2);
        let (engine, cluster, _outbox) = harness(config);

        // two dead members arrive while the region sits at the floor, so
        // neither is removed on commit
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Dead);
        let c = insert_peer(&engine, &cluster, "c", "r1", SwimState::Dead);
        let d = insert_peer(&engine, &cluster, "d", "r1", SwimState::Alive);
        let e = insert_peer(&engine, &cluster, "e", "r1", SwimState::Alive);
        assert!(cluster.contains(b) && cluster.contains(c));

        engine.clear_deads();

        // four members, floor two: both dead members swept
        assert!(!cluster.contains(b));
        assert!(!cluster.contains(c));
        assert!(cluster.contains(d) && cluster.contains(e));
        assert_eq!(engine.metrics.state.dead(), 0);
        assert_eq!(engine.read_state().with_region["r1"].len(), 2);
    }

    #[tokio::test]
    async fn test_clear_deads_partial_when_floor_binds() {
        let config = GossipConfig::default().with_min_region_peer(2);
        let (engine, cluster, _outbox) = harness(config);

        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Dead);
        let c = insert_peer(&engine, &cluster, "c", "r1", SwimState::Dead);
        let d = insert_peer(&engine, &cluster, "d", "r1", SwimState::Dead);

        engine.clear_deads();

        // three members, floor two: exactly one removal allowed
        let survivors = [b, c, d]
            .iter()
            .filter(|id| cluster.contains(**id))
            .count();
        assert_eq!(survivors, 2);
    }

    #[tokio::test]
    async fn test_dead_member_removed_above_floor_and_archived() {
        let (engine, cluster, _outbox) = harness(GossipConfig::default());

        // two alive peers keep the region above the floor of one
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);
        let _c = insert_peer(&engine, &cluster, "c", "r1", SwimState::Alive);

        // the dead claim commits, the watcher removes and archives b
        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                Ok(tag.claim_dead())
            })
            .unwrap();

        assert!(!cluster.contains(b));
        let archived = engine.lookup_leaving(&["b".into()]).unwrap();
        assert_eq!(archived.names(), ["b".to_string()]);
        assert_eq!(archived.tag().unwrap().state, SwimState::Dead);
        assert_eq!(engine.metrics.state.dead(), 0);
    }

    #[tokio::test]
    async fn test_dead_member_kept_at_floor() {
        let (engine, cluster, _outbox) = harness(GossipConfig::default());
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);

        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                Ok(tag.claim_dead())
            })
            .unwrap();

        // the only member of its region survives as DEAD
        assert!(cluster.contains(b));
        assert_eq!(committed_state(&cluster, b), Some(SwimState::Dead));
        assert_eq!(engine.metrics.state.dead(), 1);
    }

    #[tokio::test]
    async fn test_left_member_removed_regardless_of_floor() {
        let (engine, cluster, _outbox) = harness(GossipConfig::default());
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);

        cluster
            .txn(|t| -> Result<bool> {
                let tag = engine.tag_txn(t, b)?;
                Ok(tag.leave())
            })
            .unwrap();

        assert!(!cluster.contains(b));
        assert!(engine.lookup_leaving(&["b".into()]).is_some());
    }

    #[tokio::test]
    async fn test_removed_member_purged_from_detector() {
        let (engine, cluster, mut outbox) = harness(GossipConfig::default());
        let b = insert_peer(&engine, &cluster, "b", "r1", SwimState::Alive);
        let _c = insert_peer(&engine, &cluster, "c", "r1", SwimState::Alive);

        engine.ping(b, None);
        engine.on_ping_req(&["c".into()], 5, vec!["b".into()]);
        while outbox.try_recv().is_ok() {}
        assert_eq!(engine.metrics.failure_detector.ping(), 1);
        assert_eq!(engine.metrics.failure_detector.proxy_ping(), 1);

        cluster
            .membership_txn(|t| -> Result<bool> {
                t.remove_node(b)?;
                Ok(true)
            })
            .unwrap();

        let state = engine.read_state();
        assert!(state.in_ping.is_empty());
        assert!(state.round_trips.is_empty());
        drop(state);
        assert_eq!(engine.metrics.failure_detector.ping(), 0);
        assert_eq!(engine.metrics.failure_detector.proxy_failure(), 1);
    }
}
