//! Phase handlers of five nodes wired through a loopback network, following
//! a mock chain on a paused tokio clock.

use llmq_core::{
    ActiveMasternode, ChainView, FinalCommitment, Hash256, InterruptToken, LlmqConfig, MessageHandler,
    MessageKind, QuorumMembers, TaskRegistry,
};
use llmq_crypto::CryptoWorker;
use llmq_dkg::{CommitmentSink, DkgManagerDeps, DkgSessionManager, QuorumPhase};
use llmq_store::MemoryStore;
use llmq_testkit::{LoopbackMessenger, LoopbackNetwork, MockChain, MockMasternodeList};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<FinalCommitment>>);

impl CommitmentSink for RecordingSink {
    fn add_mineable_commitment(&self, commitment: FinalCommitment) -> Option<Hash256> {
        let hash = commitment.hash();
        self.0.lock().push(commitment);
        Some(hash)
    }
}

struct Node {
    manager: Arc<DkgSessionManager>,
    sink: Arc<RecordingSink>,
    messenger: Arc<LoopbackMessenger>,
}

fn spawn_nodes(chain: &Arc<MockChain>, list: &MockMasternodeList, tasks: &TaskRegistry) -> Vec<Node> {
    let config = LlmqConfig::regtest();
    let network = LoopbackNetwork::new();
    let worker = Arc::new(CryptoWorker::new(2).unwrap());
    let members = Arc::new(QuorumMembers::new(Arc::new(list.clone())));

    list.nodes()
        .iter()
        .enumerate()
        .map(|(i, local): (usize, &ActiveMasternode)| {
            let sink = Arc::new(RecordingSink::default());
            let messenger = network.messenger(i as u64);
            let manager = Arc::new(DkgSessionManager::new(
                &config,
                DkgManagerDeps {
                    chain: chain.clone(),
                    members: Arc::clone(&members),
                    messenger: messenger.clone(),
                    sink: sink.clone(),
                    worker: Arc::clone(&worker),
                    store: Arc::new(MemoryStore::new()),
                    local: Some(local.clone()),
                    interrupt: tasks.interrupt_token(),
                },
            ));
            let inbound: Arc<dyn MessageHandler> = manager.clone();
            network.register(i as u64, &inbound);
            manager.start(tasks);
            Node {
                manager,
                sink,
                messenger,
            }
        })
        .collect()
}

async fn mine_to(chain: &MockChain, nodes: &[Node], height: u32) {
    while chain.height() < height {
        let tip = chain.mine_block();
        for node in nodes {
            node.manager.updated_block_tip(&tip);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_round_emits_commitment_on_every_node() {
    llmq_testkit::init_test_tracing();
    let chain = Arc::new(MockChain::new());
    let list = MockMasternodeList::generate(5, 3);
    let tasks = TaskRegistry::new(InterruptToken::new());
    let nodes = spawn_nodes(&chain, &list, &tasks);

    chain.mine_to(23);
    mine_to(&chain, &nodes, 24).await;
    let quorum = chain.block_at_height(24).unwrap();
    mine_to(&chain, &nodes, 36).await;

    let params = LlmqConfig::regtest().params[0].clone();
    let handler = nodes[0].manager.handler(params.llmq_type).unwrap();
    assert_eq!(handler.phase_and_quorum_hash(), (QuorumPhase::Idle, quorum.hash));

    let members = QuorumMembers::new(Arc::new(list.clone())).members(&params, &quorum);
    for node in &nodes {
        let commitments = node.sink.0.lock().clone();
        assert_eq!(commitments.len(), 1);
        let fc = &commitments[0];
        assert_eq!(fc.quorum_hash, quorum.hash);
        assert!(fc.verify(&quorum, &members, &params, true));

        let contributions = node
            .manager
            .get_verified_contributions(params.llmq_type, &quorum, &fc.valid_members)
            .unwrap();
        assert_eq!(contributions.0.len(), fc.count_valid_members());

        let recorder = node.messenger.recorder();
        assert!(recorder
            .requested_quorum_nodes(params.llmq_type, &quorum.hash)
            .is_some_and(|m| !m.is_empty()));
        assert!(recorder.reports().is_empty());
        assert_eq!(recorder.relayed_of(MessageKind::FinalCommitment).len(), 1);
    }

    tasks.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reorg_before_commit_emits_nothing_for_orphaned_quorum() {
    llmq_testkit::init_test_tracing();
    let chain = Arc::new(MockChain::new());
    let list = MockMasternodeList::generate(5, 4);
    let tasks = TaskRegistry::new(InterruptToken::new());
    let nodes = spawn_nodes(&chain, &list, &tasks);

    chain.mine_to(23);
    mine_to(&chain, &nodes, 24).await;
    let orphaned = chain.block_at_height(24).unwrap();
    // Contributions and complaints are done
    mine_to(&chain, &nodes, 29).await;

    let tip = chain.reorg(23, 6, 1);
    assert_ne!(chain.block_at_height(24).unwrap(), orphaned);
    for node in &nodes {
        node.manager.updated_block_tip(&tip);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    mine_to(&chain, &nodes, 40).await;

    for node in &nodes {
        assert!(node
            .sink
            .0
            .lock()
            .iter()
            .all(|fc| fc.quorum_hash != orphaned.hash));
        assert!(node
            .messenger
            .recorder()
            .relayed_of(MessageKind::FinalCommitment)
            .is_empty());
    }

    tasks.shutdown().await;
}
