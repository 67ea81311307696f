//! Inbound DKG message queues.
//!
//! Network code only enqueues; the phase handler drains in small batches.
//! Each peer may enqueue at most `max_messages_per_node` payloads per round
//! (twice the committee size, enough to observe equivocation), and a payload
//! whose hash was already seen is dropped.

use crate::messages::DkgMessage;
use llmq_core::{Hash256, PeerId, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Peer id used for messages this node produced itself.
pub const LOCAL_PEER: PeerId = PeerId(u64::MAX);

#[derive(Default)]
struct PendingState {
    queue: VecDeque<(PeerId, Vec<u8>)>,
    per_node: HashMap<PeerId, usize>,
    seen: HashSet<Hash256>,
}

/// FIFO of raw payloads of one message kind.
pub struct PendingMessages {
    max_messages_per_node: usize,
    state: Mutex<PendingState>,
}

impl PendingMessages {
    /// Queue allowing `max_messages_per_node` payloads per peer.
    pub fn new(max_messages_per_node: usize) -> Self {
        Self {
            max_messages_per_node,
            state: Mutex::new(PendingState::default()),
        }
    }

    /// Enqueue a payload. Returns `false` if it was dropped.
    pub fn push(&self, from: PeerId, payload: Vec<u8>) -> bool {
        let hash = Hash256::sha256d(&payload);
        let mut state = self.state.lock();
        let count = state.per_node.entry(from).or_insert(0);
        if *count >= self.max_messages_per_node {
            debug!(%from, "Too many DKG messages from peer");
            return false;
        }
        *count += 1;
        if !state.seen.insert(hash) {
            debug!(%from, hash = %hash, "DKG message already seen");
            return false;
        }
        state.queue.push_back((from, payload));
        true
    }

    /// Take up to `max` payloads in arrival order.
    pub fn pop(&self, max: usize) -> Vec<(PeerId, Vec<u8>)> {
        let mut state = self.state.lock();
        let n = max.min(state.queue.len());
        state.queue.drain(..n).collect()
    }

    /// Take up to `max` payloads and decode them, keeping the payload hash.
    #[allow(clippy::type_complexity)]
    pub fn pop_and_decode<M: DkgMessage>(&self, max: usize) -> Vec<(PeerId, Hash256, Result<M>)> {
        self.pop(max)
            .into_iter()
            .map(|(from, payload)| (from, Hash256::sha256d(&payload), M::decode(&payload)))
            .collect()
    }

    /// Whether a payload with this hash was enqueued this round.
    pub fn has_seen(&self, hash: &Hash256) -> bool {
        self.state.lock().seen.contains(hash)
    }

    /// Number of queued payloads.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Forget everything, including per-peer counts and seen hashes.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.per_node.clear();
        state.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_and_flooding_are_dropped() {
        let pending = PendingMessages::new(2);
        let peer = PeerId(1);
        assert!(pending.push(peer, vec![1]));
        assert!(!pending.push(peer, vec![1]));
        // The duplicate still counted towards the per-peer limit
        assert!(!pending.push(peer, vec![2]));
        assert!(pending.push(PeerId(2), vec![2]));
        assert!(pending.has_seen(&Hash256::sha256d(&[2])));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_pop_preserves_arrival_order() {
        let pending = PendingMessages::new(10);
        for i in 0..5u8 {
            pending.push(PeerId(u64::from(i)), vec![i]);
        }
        let first: Vec<u8> = pending.pop(3).into_iter().map(|(_, p)| p[0]).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(pending.pop(8).len(), 2);
        assert!(pending.is_empty());

        pending.clear();
        assert!(!pending.has_seen(&Hash256::sha256d(&[0])));
    }
}
