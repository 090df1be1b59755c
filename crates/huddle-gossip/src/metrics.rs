//! Failure-detector and membership-state metric sinks
//!
//! Handlers accumulate an increment struct and apply it in one call, so a
//! single protocol event lands atomically across counters. With the
//! `metrics-prometheus` feature the sinks also export through the `metrics`
//! crate; without it they are plain process-local counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// One batch of failure-detector counter adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorIncrement {
    /// Outstanding direct probes.
    pub ping: i64,
    /// Outstanding indirect probe fan-outs.
    pub ping_indirect: i64,
    /// Outstanding probes carrying proxy requests.
    pub proxy_ping: i64,
    /// Proxied probes answered.
    pub proxy_success: u64,
    /// Proxied probes dropped or failed.
    pub proxy_failure: u64,
    /// Direct probes answered.
    pub success: u64,
    /// Direct probes given up on.
    pub failure: u64,
}

impl DetectorIncrement {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Failure-detector metric sink.
#[derive(Debug, Default)]
pub struct DetectorMetrics {
    ping: AtomicI64,
    ping_indirect: AtomicI64,
    proxy_ping: AtomicI64,
    proxy_success: AtomicU64,
    proxy_failure: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
}

impl DetectorMetrics {
    /// Apply one increment batch.
    pub fn apply(&self, inc: &DetectorIncrement) {
        if inc.is_zero() {
            return;
        }
        self.ping.fetch_add(inc.ping, Ordering::Relaxed);
        self.ping_indirect.fetch_add(inc.ping_indirect, Ordering::Relaxed);
        self.proxy_ping.fetch_add(inc.proxy_ping, Ordering::Relaxed);
        self.proxy_success.fetch_add(inc.proxy_success, Ordering::Relaxed);
        self.proxy_failure.fetch_add(inc.proxy_failure, Ordering::Relaxed);
        self.success.fetch_add(inc.success, Ordering::Relaxed);
        self.failure.fetch_add(inc.failure, Ordering::Relaxed);

        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::gauge!("huddle_swim_ping_inflight").increment(inc.ping as f64);
            metrics::gauge!("huddle_swim_ping_indirect_inflight")
                .increment(inc.ping_indirect as f64);
            metrics::gauge!("huddle_swim_proxy_ping_inflight").increment(inc.proxy_ping as f64);
            metrics::counter!("huddle_swim_proxy_success_total").increment(inc.proxy_success);
            metrics::counter!("huddle_swim_proxy_failure_total").increment(inc.proxy_failure);
            metrics::counter!("huddle_swim_success_total").increment(inc.success);
            metrics::counter!("huddle_swim_failure_total").increment(inc.failure);
        }
    }

    pub fn ping(&self) -> i64 {
        self.ping.load(Ordering::Relaxed)
    }
    pub fn ping_indirect(&self) -> i64 {
        self.ping_indirect.load(Ordering::Relaxed)
    }
    pub fn proxy_ping(&self) -> i64 {
        self.proxy_ping.load(Ordering::Relaxed)
    }
    pub fn proxy_success(&self) -> u64 {
        self.proxy_success.load(Ordering::Relaxed)
    }
    pub fn proxy_failure(&self) -> u64 {
        self.proxy_failure.load(Ordering::Relaxed)
    }
    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }
    pub fn failure(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }
}

/// One batch of membership-state tally adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateIncrement {
    pub alive: i64,
    pub suspected: i64,
    pub dead: i64,
    pub left: i64,
}

impl StateIncrement {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Membership-state tally sink. The four tallies sum to the number of
/// tracked members.
#[derive(Debug, Default)]
pub struct StateMetrics {
    alive: AtomicI64,
    suspected: AtomicI64,
    dead: AtomicI64,
    left: AtomicI64,
}

impl StateMetrics {
    /// Apply one increment batch.
    pub fn apply(&self, inc: &StateIncrement) {
        if inc.is_zero() {
            return;
        }
        self.alive.fetch_add(inc.alive, Ordering::Relaxed);
        self.suspected.fetch_add(inc.suspected, Ordering::Relaxed);
        self.dead.fetch_add(inc.dead, Ordering::Relaxed);
        self.left.fetch_add(inc.left, Ordering::Relaxed);

        #[cfg(feature = "metrics-prometheus")]
        {
            metrics::gauge!("huddle_swim_members", "state" => "alive").increment(inc.alive as f64);
            metrics::gauge!("huddle_swim_members", "state" => "suspected")
                .increment(inc.suspected as f64);
            metrics::gauge!("huddle_swim_members", "state" => "dead").increment(inc.dead as f64);
            metrics::gauge!("huddle_swim_members", "state" => "left").increment(inc.left as f64);
        }
    }

    pub fn alive(&self) -> i64 {
        self.alive.load(Ordering::Relaxed)
    }
    pub fn suspected(&self) -> i64 {
        self.suspected.load(Ordering::Relaxed)
    }
    pub fn dead(&self) -> i64 {
        self.dead.load(Ordering::Relaxed)
    }
    pub fn left(&self) -> i64 {
        self.left.load(Ordering::Relaxed)
    }
}

/// Both engine metric sinks.
#[derive(Debug, Default)]
pub struct Metrics {
    pub failure_detector: DetectorMetrics,
    pub state: StateMetrics,
}
