//! Expiry queue for suspected members
//!
//! A binary min-heap ordered by expiry timestamp, augmented with a
//! node-to-position index so an arbitrary member can be removed in
//! O(log n) when its suspicion is refuted or the member disappears.

use std::collections::HashMap;

use tokio::time::Instant;

use huddle_store::NodeId;

#[derive(Debug, Clone, Copy)]
struct Suspicion {
    node: NodeId,
    not_after: Instant,
}

/// Priority queue of pending suspicions keyed by expiry time.
#[derive(Debug, Default)]
pub struct SuspicionQueue {
    heap: Vec<Suspicion>,
    index: HashMap<NodeId, usize>,
}

impl SuspicionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    /// Queue a suspicion. Returns false if the member is already queued.
    pub fn push(&mut self, node: NodeId, not_after: Instant) -> bool {
        if self.index.contains_key(&node) {
            return false;
        }
        let at = self.heap.len();
        self.heap.push(Suspicion { node, not_after });
        self.index.insert(node, at);
        self.sift_up(at);
        true
    }

    /// Drop a member's suspicion, wherever it sits in the heap.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let Some(at) = self.index.remove(&node) else {
            return false;
        };
        let last = self.heap.len() - 1;
        self.heap.swap(at, last);
        self.heap.pop();
        if at < self.heap.len() {
            self.index.insert(self.heap[at].node, at);
            self.sift_down(at);
            self.sift_up(at);
        }
        true
    }

    /// The earliest-expiring suspicion.
    pub fn peek_min(&self) -> Option<(NodeId, Instant)> {
        self.heap.first().map(|s| (s.node, s.not_after))
    }

    /// Pop every suspicion that expired strictly before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<NodeId> {
        let mut expired = Vec::new();
        while let Some(first) = self.heap.first() {
            if first.not_after >= now {
                break;
            }
            let node = first.node;
            self.remove(node);
            expired.push(node);
        }
        expired
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[parent].not_after <= self.heap[at].not_after {
                break;
            }
            self.swap_entries(parent, at);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.heap.len() && self.heap[right].not_after < self.heap[left].not_after {
                smallest = right;
            }
            if self.heap[at].not_after <= self.heap[smallest].not_after {
                break;
            }
            self.swap_entries(at, smallest);
            at = smallest;
        }
    }

    fn swap_entries(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].node, a);
        self.index.insert(self.heap[b].node, b);
    }
}
