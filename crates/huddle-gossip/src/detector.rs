//! Failure detection: direct probes, indirect probes through proxies, and
//! their timeouts
//!
//! Probe flow: `detect_failure` pings a random fan-out of members. A ping
//! with no ack by twice the round-trip estimate fans out `PingReq` to
//! random proxies; if the indirect round also times out, the target's tag
//! gets a SUSPECTED claim. Acks, direct or relayed, resolve the one
//! outstanding context per target and settle every proxied probe queued on
//! it. Timeout events funnel through two queues into a single dispatcher,
//! so timeout processing is serialized.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::IteratorRandom;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use huddle_store::NodeId;

use crate::engine::{Engine, PingContext, PingContextShared, ProxyPingRequest};
use crate::error::Result;
use crate::metrics::DetectorIncrement;
use crate::protocol::{decode_message, GossipMessage};

impl Engine {
    /// Probe one random fan-out of members. One round of the detector.
    pub fn detect_failure(&self) {
        if !self.arbiter.should_run() {
            return;
        }
        for target in self.select_random_nodes(self.config.gossip_fanout, true) {
            self.ping(target, None);
        }
    }

    /// Up to `count` distinct members, uniformly at random.
    pub(crate) fn select_random_nodes(&self, count: usize, exclude_self: bool) -> Vec<NodeId> {
        let self_id = self.cluster.self_id();
        self.cluster
            .node_ids()
            .into_iter()
            .filter(|id| !exclude_self || *id != self_id)
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    /// Probe `target`, reusing its outstanding context if one exists.
    /// A proxied request rides along on whichever probe is in flight.
    pub(crate) fn ping(&self, target: NodeId, proxy_req: Option<ProxyPingRequest>) {
        let Some(names) = self.cluster.names(target) else {
            return;
        };

        let mut inc = DetectorIncrement::default();
        let mut outbound = None;
        {
            let mut state = self.write_state();
            let context = match state.in_ping.get(&target).cloned() {
                Some(context) => context,
                None => {
                    let id = self.generate_message_id();
                    let context = Arc::new(PingContext {
                        id,
                        start: Instant::now(),
                        shared: std::sync::Mutex::new(PingContextShared::default()),
                    });
                    state.in_ping.insert(target, context.clone());
                    inc.ping += 1;
                    outbound = Some(GossipMessage::Ping { id });

                    let delay = self.estimated_round_trip(&state, target) * 2;
                    let timed_out = self.ping_timeout_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = timed_out.send(target).await;
                    });
                    context
                }
            };

            if let Some(proxy_req) = proxy_req {
                context
                    .shared
                    .lock()
                    .expect("ping context lock poisoned")
                    .proxy_for
                    .push(proxy_req);
                inc.proxy_ping += 1;
            }
        }

        if let Some(message) = outbound {
            self.send_message(&names, message);
        }
        self.metrics.failure_detector.apply(&inc);
    }

    /// Decode and dispatch one inbound message from a member known by
    /// `from`. Undecodable payloads are logged and discarded.
    pub fn handle_message(&self, from: &[String], payload: &[u8]) {
        match decode_message(payload) {
            Ok(message) => self.dispatch(from, message),
            Err(e) => warn!(error = %e, "discarding undecodable gossip message"),
        }
    }

    /// Dispatch one decoded inbound message.
    pub fn dispatch(&self, from: &[String], message: GossipMessage) {
        match message {
            GossipMessage::Ping { id } => self.on_ping(from, id),
            GossipMessage::Ack {
                id,
                names_proxy_for,
            } => self.on_ping_ack(from, id, &names_proxy_for),
            GossipMessage::PingReq { id, name } => self.on_ping_req(from, id, name),
        }
    }

    pub(crate) fn on_ping(&self, from: &[String], id: u64) {
        self.send_message(
            from,
            GossipMessage::Ack {
                id,
                names_proxy_for: Vec::new(),
            },
        );
    }

    /// Resolve an ack to its outstanding probe: record the round trip,
    /// relay acks to every proxied requester queued on the context, then
    /// drop the context.
    pub(crate) fn on_ping_ack(&self, from: &[String], id: u64, names_proxy_for: &[String]) {
        let target = if names_proxy_for.is_empty() {
            self.cluster.most_possible_node(from)
        } else {
            self.cluster.most_possible_node(names_proxy_for)
        };
        let Some(target) = target else {
            return;
        };

        let mut inc = DetectorIncrement::default();
        let mut relays: Vec<(Vec<String>, GossipMessage)> = Vec::new();
        {
            let mut state = self.write_state();
            let Some(context) = state.in_ping.remove(&target) else {
                debug!(id, node = %target, "ack without outstanding probe; dropped");
                return;
            };
            state.round_trips.insert(target, context.start.elapsed());

            let shared = context.shared.lock().expect("ping context lock poisoned");
            for proxy in &shared.proxy_for {
                relays.push((
                    proxy.origin.clone(),
                    GossipMessage::Ack {
                        id: proxy.id,
                        names_proxy_for: proxy.target.clone(),
                    },
                ));
            }
            inc.proxy_success += shared.proxy_for.len() as u64;
            inc.ping -= 1;
            inc.success += 1;
        }

        for (to, message) in relays {
            self.send_message(&to, message);
        }
        self.metrics.failure_detector.apply(&inc);
    }

    /// Serve an indirect-probe request by probing the named target
    /// ourselves and queueing the requester on the context.
    pub(crate) fn on_ping_req(&self, from: &[String], id: u64, name: Vec<String>) {
        if name.is_empty() {
            return;
        }
        let Some(target) = self.cluster.most_possible_node(&name) else {
            self.metrics.failure_detector.apply(&DetectorIncrement {
                proxy_failure: 1,
                ..Default::default()
            });
            return;
        };
        self.ping(
            target,
            Some(ProxyPingRequest {
                origin: from.to_vec(),
                target: name,
                id,
            }),
        );
    }

    /// The direct probe went unanswered: fan out `PingReq` to random
    /// proxies and arm the indirect-probe timeout.
    pub(crate) fn process_ping_timeout(&self, target: NodeId) {
        let context = self.read_state().in_ping.get(&target).cloned();
        let Some(context) = context else {
            return; // the ack already settled it
        };
        let Some(target_names) = self.cluster.names(target) else {
            return;
        };

        let proxies: Vec<(NodeId, Vec<String>)> = self
            .select_random_nodes(self.config.ping_proxies_count, true)
            .into_iter()
            .filter(|proxy| *proxy != target)
            .filter_map(|proxy| self.cluster.names(proxy).map(|names| (proxy, names)))
            .collect();

        let mut inc = DetectorIncrement::default();
        let mut sends: Vec<(Vec<String>, GossipMessage)> = Vec::new();
        let mut timeout = Duration::ZERO;
        {
            let state = self.read_state();
            let mut shared = context.shared.lock().expect("ping context lock poisoned");
            for (proxy, proxy_names) in proxies {
                sends.push((
                    proxy_names,
                    GossipMessage::PingReq {
                        id: context.id,
                        name: target_names.clone(),
                    },
                ));
                shared.indirects += 1;
                inc.ping_indirect += 1;

                // indirect timeout follows the fastest selected proxy
                let rtt = self.estimated_round_trip(&state, proxy);
                if timeout.is_zero() || rtt < timeout {
                    timeout = rtt;
                }
            }
        }
        if self.config.gossip_period > timeout {
            timeout = self.config.gossip_period;
        }

        for (to, message) in sends {
            self.send_message(&to, message);
        }
        self.metrics.failure_detector.apply(&inc);

        let delay = timeout * self.config.min_ping_req_timeout_times;
        let timed_out = self.ping_req_timeout_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timed_out.send(target).await;
        });
    }

    /// The indirect round went unanswered too: claim the target suspected
    /// and settle the probe as a failure.
    pub(crate) fn process_ping_req_timeout(&self, target: NodeId) {
        if !self.read_state().in_ping.contains_key(&target) {
            return; // the ack already settled it
        }

        if let Err(e) = self.cluster.txn(|t| -> Result<bool> {
            self.mark_internal(t.id());
            let tag = self.tag_txn(t, target)?;
            tag.claim_suspected();
            Ok(true)
        }) {
            error!(node = %target, error = %e, "transaction commit failure while claiming suspicion");
        }

        let mut inc = DetectorIncrement::default();
        {
            let mut state = self.write_state();
            if let Some(context) = state.in_ping.remove(&target) {
                inc.ping -= 1;
                inc.failure += 1;
                let shared = context.shared.lock().expect("ping context lock poisoned");
                if shared.indirects > 0 {
                    inc.ping_indirect -= i64::from(shared.indirects);
                }
            }
        }
        self.metrics.failure_detector.apply(&inc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use crate::tag::{SwimState, SwimTag};
    use crate::transport::ChannelTransport;
    use huddle_store::Cluster;
    use tokio::sync::mpsc;

    type Outbox = mpsc::UnboundedReceiver<(Vec<String>, GossipMessage)>;

    fn harness(peers: &[&str]) -> (Arc<Engine>, Outbox, Vec<NodeId>) {
        let cluster = Cluster::new(vec!["self".into()]);
        let (transport, outbox) = ChannelTransport::new();
        let config = GossipConfig::default().with_region("r1");
        let engine = Engine::new(cluster.clone(), transport, config);

        let ids = peers
            .iter()
            .map(|name| {
                cluster
                    .membership_txn(|t| -> Result<bool> {
                        let id = t.insert_node(vec![name.to_string()])?;
                        let tag = engine.tag_txn(t, id)?;
                        tag.set_region("r1");
                        Ok(true)
                    })
                    .unwrap();
                cluster.most_possible_node(&[name.to_string()]).unwrap()
            })
            .collect();

        (engine, outbox, ids)
    }

    fn drain(outbox: &mut Outbox) -> Vec<(Vec<String>, GossipMessage)> {
        let mut messages = Vec::new();
        while let Ok(message) = outbox.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_direct_ack_clears_probe() {
        let (engine, mut outbox, ids) = harness(&["b"]);
        let b = ids[0];

        engine.ping(b, None);
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec!["b".to_string()]);
        let id = match &sent[0].1 {
            GossipMessage::Ping { id } => *id,
            other => panic!("expected a ping, got {other:?}"),
        };
        assert_eq!(engine.metrics.failure_detector.ping(), 1);

        engine.on_ping_ack(&["b".into()], id, &[]);

        let state = engine.read_state();
        assert!(state.in_ping.is_empty());
        assert!(state.round_trips.contains_key(&b));
        drop(state);
        assert_eq!(engine.metrics.failure_detector.ping(), 0);
        assert_eq!(engine.metrics.failure_detector.success(), 1);
    }

    #[tokio::test]
    async fn test_ping_reuses_outstanding_context() {
        let (engine, mut outbox, ids) = harness(&["b"]);
        let b = ids[0];

        engine.ping(b, None);
        engine.ping(b, None);

        assert_eq!(drain(&mut outbox).len(), 1);
        assert_eq!(engine.metrics.failure_detector.ping(), 1);
    }

    #[tokio::test]
    async fn test_ping_answered_with_ack() {
        let (engine, mut outbox, _) = harness(&["b"]);
        engine.dispatch(&["b".into()], GossipMessage::Ping { id: 55 });

        let sent = drain(&mut outbox);
        assert_eq!(
            sent,
            vec![(
                vec!["b".to_string()],
                GossipMessage::Ack {
                    id: 55,
                    names_proxy_for: Vec::new()
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_stray_ack_dropped() {
        let (engine, _outbox, _) = harness(&["b"]);
        engine.on_ping_ack(&["b".into()], 99, &[]);
        assert_eq!(engine.metrics.failure_detector.success(), 0);
    }

    #[tokio::test]
    async fn test_ping_req_for_unknown_target_fails() {
        let (engine, _outbox, _) = harness(&["b"]);
        engine.on_ping_req(&["b".into()], 7, vec!["ghost".into()]);
        assert_eq!(engine.metrics.failure_detector.proxy_failure(), 1);
    }

    #[tokio::test]
    async fn test_proxied_probe_relays_ack() {
        // serving a ping-req: probe the target, then relay the ack back to
        // the origin with the origin's id and target names
        let (engine, mut outbox, ids) = harness(&["b", "c"]);
        let b = ids[0];

        engine.on_ping_req(&["c".into()], 77, vec!["b".into()]);
        assert_eq!(engine.metrics.failure_detector.proxy_ping(), 1);

        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        let id = match &sent[0].1 {
            GossipMessage::Ping { id } => *id,
            other => panic!("expected a ping, got {other:?}"),
        };

        engine.on_ping_ack(&["b".into()], id, &[]);

        let sent = drain(&mut outbox);
        assert_eq!(
            sent,
            vec![(
                vec!["c".to_string()],
                GossipMessage::Ack {
                    id: 77,
                    names_proxy_for: vec!["b".to_string()]
                }
            )]
        );
        assert_eq!(engine.metrics.failure_detector.proxy_success(), 1);
        assert_eq!(engine.metrics.failure_detector.success(), 1);
        assert!(engine.read_state().in_ping.get(&b).is_none());
    }

    #[tokio::test]
    async fn test_ping_timeout_fans_out_ping_req() {
        let (engine, mut outbox, ids) = harness(&["b", "c", "d"]);
        let b = ids[0];

        engine.ping(b, None);
        let id = match &drain(&mut outbox)[0].1 {
            GossipMessage::Ping { id } => *id,
            other => panic!("expected a ping, got {other:?}"),
        };

        engine.process_ping_timeout(b);

        let sent = drain(&mut outbox);
        // both other members asked to probe b indirectly
        assert_eq!(sent.len(), 2);
        for (to, message) in &sent {
            assert_ne!(to, &vec!["b".to_string()]);
            assert_eq!(
                message,
                &GossipMessage::PingReq {
                    id,
                    name: vec!["b".to_string()]
                }
            );
        }
        assert_eq!(engine.metrics.failure_detector.ping_indirect(), 2);

        // a relayed ack resolves the probe by the proxied target names
        engine.on_ping_ack(&["c".into()], id, &["b".into()]);
        assert!(engine.read_state().in_ping.is_empty());
        assert_eq!(engine.metrics.failure_detector.success(), 1);
    }

    #[tokio::test]
    async fn test_ping_req_timeout_raises_suspicion() {
        let (engine, mut outbox, ids) = harness(&["b", "c"]);
        let b = ids[0];

        engine.ping(b, None);
        engine.process_ping_timeout(b);
        drain(&mut outbox);

        engine.process_ping_req_timeout(b);

        let value = engine
            .cluster
            .value(b, crate::config::DEFAULT_SWIM_TAG_KEY)
            .unwrap();
        assert_eq!(SwimTag::decode(&value).unwrap().state, SwimState::Suspected);

        let state = engine.read_state();
        assert!(state.in_ping.is_empty());
        assert!(state.suspicions.contains(b));
        drop(state);

        assert_eq!(engine.metrics.failure_detector.ping(), 0);
        assert_eq!(engine.metrics.failure_detector.failure(), 1);
        assert_eq!(engine.metrics.failure_detector.ping_indirect(), 0);
        assert_eq!(engine.metrics.state.suspected(), 1);

        // a second timeout for the same target finds nothing to do
        engine.process_ping_req_timeout(b);
        assert_eq!(engine.metrics.failure_detector.failure(), 1);
    }

    #[tokio::test]
    async fn test_detect_failure_probes_fanout() {
        let (engine, mut outbox, _) = harness(&["b", "c", "d", "e"]);
        engine.detect_failure();

        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), engine.config.gossip_fanout);
        for (to, message) in &sent {
            assert_ne!(to, &vec!["self".to_string()]);
            assert!(matches!(message, GossipMessage::Ping { .. }));
        }
    }
}
