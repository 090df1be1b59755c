//! Archive of recently removed members
//!
//! Removed members keep their identity and a snapshot of their entries for
//! a bounded window, so gossip still in flight about them can be recognized
//! and discarded instead of resurrecting the member. Entries expire after
//! thirty gossip periods; re-tracing a name evicts whatever record held it
//! before.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use huddle_store::NodeSnapshot;

use crate::engine::{Engine, EngineState};
use crate::tag::SwimTag;

/// A removed member: its name set and the last snapshot of its entries.
#[derive(Debug)]
pub struct LeavingNode {
    names: Vec<String>,
    snapshot: NodeSnapshot,
    tag_idx: Option<usize>,
}

impl LeavingNode {
    pub(crate) fn new(names: Vec<String>, snapshot: NodeSnapshot) -> Self {
        Self {
            names,
            snapshot,
            tag_idx: None,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn snapshot(&self) -> &NodeSnapshot {
        &self.snapshot
    }

    /// The membership tag the member carried when it was removed.
    pub fn tag(&self) -> Option<SwimTag> {
        self.tag_idx
            .and_then(|at| self.snapshot.kvs.get(at))
            .and_then(|kv| SwimTag::decode_stored(&kv.value).ok())
    }
}

impl Engine {
    /// Archive a removed member and arm its retention timer. Anonymous
    /// members are not worth remembering.
    pub(crate) fn trace_leaving_node(&self, mut leaving: LeavingNode) {
        if leaving.names.is_empty() {
            debug!("ignoring anonymous leaving member");
            return;
        }

        leaving.tag_idx = leaving
            .snapshot
            .kvs
            .iter()
            .position(|kv| kv.key == self.config.swim_tag_key);
        let leaving = Arc::new(leaving);

        {
            let mut state = self.write_state();

            // a re-used name supersedes whatever record held it
            let collisions: HashSet<usize> = leaving
                .names
                .iter()
                .filter_map(|name| state.leaving_name_index.get(name).copied())
                .collect();
            if !collisions.is_empty() {
                remove_leaving_entries(&mut state, &collisions);
            }

            let at = state.leaving_nodes.len();
            state.leaving_nodes.push(leaving.clone());
            for name in &leaving.names {
                state.leaving_name_index.insert(name.clone(), at);
            }
        }

        let retention = self.config.gossip_period * 30;
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(engine) = weak.upgrade() {
                engine.untrace_leaving_node(&leaving);
            }
        });
    }

    /// Expire an archived record, unless its names were re-bound to a newer
    /// record in the meantime.
    fn untrace_leaving_node(&self, leaving: &Arc<LeavingNode>) {
        let mut state = self.write_state();
        let stale: HashSet<usize> = leaving
            .names()
            .iter()
            .filter_map(|name| {
                state
                    .leaving_name_index
                    .get(name)
                    .copied()
                    .filter(|&at| Arc::ptr_eq(&state.leaving_nodes[at], leaving))
            })
            .collect();
        if !stale.is_empty() {
            remove_leaving_entries(&mut state, &stale);
        }
    }

    /// Look up an archived member by any of its names.
    pub fn lookup_leaving(&self, names: &[String]) -> Option<Arc<LeavingNode>> {
        let state = self.read_state();
        names
            .iter()
            .find_map(|name| state.leaving_name_index.get(name))
            .map(|&at| state.leaving_nodes[at].clone())
    }
}

fn remove_leaving_entries(state: &mut EngineState, victims: &HashSet<usize>) {
    let drained: Vec<Arc<LeavingNode>> = state.leaving_nodes.drain(..).collect();
    state.leaving_nodes = drained
        .into_iter()
        .enumerate()
        .filter(|(at, _)| !victims.contains(at))
        .map(|(_, node)| node)
        .collect();

    state.leaving_name_index.clear();
    for (at, node) in state.leaving_nodes.iter().enumerate() {
        for name in node.names() {
            state.leaving_name_index.insert(name.clone(), at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use crate::transport::ChannelTransport;
    use huddle_store::{Cluster, KeyValue};
    use std::time::Duration;

    fn engine_with_period(period: Duration) -> Arc<Engine> {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, _outbox) = ChannelTransport::new();
        let config = GossipConfig::default().with_gossip_period(period);
        Engine::new(cluster, transport, config)
    }

    fn leaving(names: &[&str], tag: &str) -> LeavingNode {
        LeavingNode::new(
            names.iter().map(|n| n.to_string()).collect(),
            NodeSnapshot {
                names: names.iter().map(|n| n.to_string()).collect(),
                kvs: vec![
                    KeyValue::new("other", "x"),
                    KeyValue::new(crate::config::DEFAULT_SWIM_TAG_KEY, tag),
                ],
            },
        )
    }

    #[tokio::test]
    async fn test_trace_and_lookup() {
        let engine = engine_with_period(Duration::from_secs(1));
        engine.trace_leaving_node(leaving(&["b", "b-alt"], r#"{"v":3,"s":2}"#));

        let record = engine.lookup_leaving(&["b-alt".into()]).unwrap();
        assert_eq!(record.names(), ["b".to_string(), "b-alt".to_string()]);
        let tag = record.tag().unwrap();
        assert_eq!(tag.version, 3);
        assert_eq!(tag.state, crate::tag::SwimState::Dead);
    }

    #[tokio::test]
    async fn test_anonymous_member_ignored() {
        let engine = engine_with_period(Duration::from_secs(1));
        engine.trace_leaving_node(LeavingNode::new(Vec::new(), NodeSnapshot::default()));
        assert!(engine.read_state().leaving_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_name_collision_evicts_older_record() {
        let engine = engine_with_period(Duration::from_secs(1));
        engine.trace_leaving_node(leaving(&["b", "b-alt"], "{}"));
        engine.trace_leaving_node(leaving(&["b"], r#"{"v":9}"#));

        // the older record lost all of its names
        assert!(engine.lookup_leaving(&["b-alt".into()]).is_none());
        let record = engine.lookup_leaving(&["b".into()]).unwrap();
        assert_eq!(record.tag().unwrap().version, 9);

        let state = engine.read_state();
        assert_eq!(state.leaving_nodes.len(), 1);
        assert_eq!(state.leaving_name_index.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_after_retention_window() {
        let period = Duration::from_millis(100);
        let engine = engine_with_period(period);
        engine.trace_leaving_node(leaving(&["b"], "{}"));

        tokio::time::sleep(period * 29).await;
        assert!(engine.lookup_leaving(&["b".into()]).is_some());

        tokio::time::sleep(period * 2).await;
        assert!(engine.lookup_leaving(&["b".into()]).is_none());
        assert!(engine.read_state().leaving_nodes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebound_name_survives_old_timer() {
        let period = Duration::from_millis(100);
        let engine = engine_with_period(period);
        engine.trace_leaving_node(leaving(&["b"], "{}"));

        // shortly before expiry the name is re-traced by a newer record
        tokio::time::sleep(period * 29).await;
        engine.trace_leaving_node(leaving(&["b"], r#"{"v":2}"#));

        // the first record's timer fires without touching the new binding
        tokio::time::sleep(period * 2).await;
        let record = engine.lookup_leaving(&["b".into()]).unwrap();
        assert_eq!(record.tag().unwrap().version, 2);

        // the new record still expires on its own schedule
        tokio::time::sleep(period * 29).await;
        assert!(engine.lookup_leaving(&["b".into()]).is_none());
    }
}
