//! Peer-to-peer test doubles.
//!
//! [`RecordingMessenger`] only records what it is asked to do.
//! [`LoopbackNetwork`] connects several nodes in-process: a relay from one
//! node is delivered synchronously to every other registered node.

use llmq_core::{Hash256, LlmqType, MessageHandler, MessageKind, PeerId, PeerMessenger};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

/// A recorded misbehaviour report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MisbehaviourReport {
    /// Reported peer
    pub peer: PeerId,
    /// Score
    pub score: u32,
    /// Reason string
    pub reason: String,
}

/// Messenger that records relays, reports and connection requests.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    relayed: Mutex<Vec<(MessageKind, Vec<u8>)>>,
    reports: Mutex<Vec<MisbehaviourReport>>,
    quorum_nodes: Mutex<BTreeMap<(LlmqType, Hash256), BTreeSet<Hash256>>>,
}

impl RecordingMessenger {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything relayed so far.
    pub fn relayed(&self) -> Vec<(MessageKind, Vec<u8>)> {
        self.relayed.lock().clone()
    }

    /// Relayed payloads of one kind.
    pub fn relayed_of(&self, kind: MessageKind) -> Vec<Vec<u8>> {
        self.relayed
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Misbehaviour reports so far.
    pub fn reports(&self) -> Vec<MisbehaviourReport> {
        self.reports.lock().clone()
    }

    /// Members requested for a quorum.
    pub fn requested_quorum_nodes(&self, llmq_type: LlmqType, quorum_hash: &Hash256) -> Option<BTreeSet<Hash256>> {
        self.quorum_nodes.lock().get(&(llmq_type, *quorum_hash)).cloned()
    }
}

impl PeerMessenger for RecordingMessenger {
    fn relay(&self, kind: MessageKind, payload: Vec<u8>) {
        self.relayed.lock().push((kind, payload));
    }

    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str) {
        self.reports.lock().push(MisbehaviourReport {
            peer,
            score,
            reason: reason.to_string(),
        });
    }

    fn set_quorum_nodes(&self, llmq_type: LlmqType, quorum_hash: Hash256, members: BTreeSet<Hash256>) {
        self.quorum_nodes.lock().insert((llmq_type, quorum_hash), members);
    }

    fn quorum_nodes(&self, llmq_type: LlmqType) -> BTreeSet<Hash256> {
        self.quorum_nodes
            .lock()
            .keys()
            .filter(|(t, _)| *t == llmq_type)
            .map(|(_, h)| *h)
            .collect()
    }

    fn remove_quorum_nodes(&self, llmq_type: LlmqType, quorum_hash: Hash256) {
        self.quorum_nodes.lock().remove(&(llmq_type, quorum_hash));
    }
}

/// In-process network of message handlers.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: Mutex<Vec<(PeerId, Weak<dyn MessageHandler>)>>,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messenger for node `id`. Its relays reach every other node as
    /// coming from `PeerId(id)`; everything is also recorded.
    pub fn messenger(self: &Arc<Self>, id: u64) -> Arc<LoopbackMessenger> {
        Arc::new(LoopbackMessenger {
            network: Arc::clone(self),
            id: PeerId(id),
            recorder: RecordingMessenger::new(),
        })
    }

    /// Register the inbound handler of node `id`.
    pub fn register(&self, id: u64, handler: &Arc<dyn MessageHandler>) {
        self.nodes.lock().push((PeerId(id), Arc::downgrade(handler)));
    }

    fn deliver(&self, from: PeerId, kind: MessageKind, payload: &[u8]) {
        // Collect first so handlers never run under our lock
        let targets: Vec<Arc<dyn MessageHandler>> = self
            .nodes
            .lock()
            .iter()
            .filter(|(id, _)| *id != from)
            .filter_map(|(_, h)| h.upgrade())
            .collect();
        for handler in targets {
            handler.process_message(from, kind, payload);
        }
    }
}

/// One node's view of a [`LoopbackNetwork`].
pub struct LoopbackMessenger {
    network: Arc<LoopbackNetwork>,
    id: PeerId,
    recorder: RecordingMessenger,
}

impl LoopbackMessenger {
    /// What this node did on the network.
    pub fn recorder(&self) -> &RecordingMessenger {
        &self.recorder
    }
}

impl PeerMessenger for LoopbackMessenger {
    fn relay(&self, kind: MessageKind, payload: Vec<u8>) {
        self.network.deliver(self.id, kind, &payload);
        self.recorder.relay(kind, payload);
    }

    fn misbehaving(&self, peer: PeerId, score: u32, reason: &str) {
        self.recorder.misbehaving(peer, score, reason);
    }

    fn set_quorum_nodes(&self, llmq_type: LlmqType, quorum_hash: Hash256, members: BTreeSet<Hash256>) {
        self.recorder.set_quorum_nodes(llmq_type, quorum_hash, members);
    }

    fn quorum_nodes(&self, llmq_type: LlmqType) -> BTreeSet<Hash256> {
        self.recorder.quorum_nodes(llmq_type)
    }

    fn remove_quorum_nodes(&self, llmq_type: LlmqType, quorum_hash: Hash256) {
        self.recorder.remove_quorum_nodes(llmq_type, quorum_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Inbox(Mutex<Vec<(PeerId, MessageKind)>>);

    impl MessageHandler for Inbox {
        fn process_message(&self, peer: PeerId, kind: MessageKind, _payload: &[u8]) {
            self.0.lock().push((peer, kind));
        }
    }

    #[test]
    fn test_relay_reaches_everyone_else() {
        let net = LoopbackNetwork::new();
        let a: Arc<Inbox> = Arc::default();
        let b: Arc<Inbox> = Arc::default();
        let a_dyn: Arc<dyn MessageHandler> = a.clone();
        let b_dyn: Arc<dyn MessageHandler> = b.clone();
        net.register(1, &a_dyn);
        net.register(2, &b_dyn);

        net.messenger(1).relay(MessageKind::Complaint, vec![1]);
        assert!(a.0.lock().is_empty());
        assert_eq!(b.0.lock().as_slice(), &[(PeerId(1), MessageKind::Complaint)]);
    }
}
