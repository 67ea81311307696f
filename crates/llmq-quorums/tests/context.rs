//! Five full nodes run a DKG round, mine its commitment and use the
//! resulting quorum to recover and verify a threshold signature.

use llmq_core::{
    BlsId, ChainView, FinalCommitment, Hash256, LlmqConfig, MessageHandler, Signature,
};
use llmq_quorums::{build_sign_hash, LlmqContext, RecoveredSigVerdict};
use llmq_store::MemoryStore;
use llmq_testkit::{LoopbackNetwork, MockChain, MockMasternodeList};
use std::sync::Arc;
use std::time::Duration;

fn spawn_nodes(chain: &Arc<MockChain>, list: &MockMasternodeList) -> Vec<Arc<LlmqContext>> {
    let network = LoopbackNetwork::new();
    list.nodes()
        .iter()
        .enumerate()
        .map(|(i, local)| {
            let ctx = Arc::new(
                LlmqContext::new(
                    LlmqConfig::regtest(),
                    chain.clone(),
                    Arc::new(list.clone()),
                    network.messenger(i as u64),
                    Arc::new(MemoryStore::new()),
                    Some(local.clone()),
                )
                .unwrap(),
            );
            let inbound: Arc<dyn MessageHandler> = ctx.clone();
            network.register(i as u64, &inbound);
            ctx.start();
            ctx
        })
        .collect()
}

/// Mine up to `height`, letting the first node pick each block's
/// commitment and every node validate it.
async fn mine_to(chain: &MockChain, nodes: &[Arc<LlmqContext>], height: u32) {
    while chain.height() < height {
        let next = chain.height() + 1;
        let commitments: Vec<FinalCommitment> = nodes[0]
            .ledger()
            .get_mineable_commitment(next)
            .unwrap()
            .into_iter()
            .collect();
        let tip = chain.mine_block();
        for node in nodes {
            node.ledger().process_block(&tip, &commitments).unwrap();
            node.updated_block_tip(&tip);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_mined_quorum_recovers_and_verifies_signatures() {
    llmq_testkit::init_test_tracing();
    let chain = Arc::new(MockChain::new());
    let list = MockMasternodeList::generate(5, 9);
    let nodes = spawn_nodes(&chain, &list);

    chain.mine_to(23);
    mine_to(&chain, &nodes, 24).await;
    let quorum_block = chain.block_at_height(24).unwrap();
    mine_to(&chain, &nodes, 44).await;

    let id = Hash256::sha256d(b"request");
    let msg_hash = Hash256::sha256d(b"message");
    let sign_hash = build_sign_hash(&quorum_block.hash, &id, &msg_hash);
    let mut shares = Vec::new();
    for (node, local) in nodes.iter().zip(list.nodes()) {
        assert!(node.ledger().has_mined_commitment(&quorum_block.hash).unwrap());
        let quorum = node.quorums().get_quorum(&quorum_block.hash).unwrap();
        assert!(quorum.has_verification_vector());
        assert!(quorum.is_valid_member(&local.pro_tx_hash));

        let selected = node.quorums().select_quorum_for_signing(&id, None, 0).unwrap();
        assert_eq!(selected.quorum_hash(), quorum_block.hash);

        let sk_share = quorum.get_secret_key_share().unwrap();
        shares.push((BlsId::from_hash(&local.pro_tx_hash), sk_share.sign(&sign_hash)));
    }

    let threshold = nodes[0].quorums().params().threshold;
    let recovered = Signature::recover(&shares[..threshold]).unwrap();
    assert_eq!(Signature::recover(&shares[shares.len() - threshold..]), Some(recovered));
    for node in &nodes {
        assert_eq!(
            node.quorums().verify_recovered_sig(None, &id, &msg_hash, &recovered, 0),
            RecoveredSigVerdict::Valid
        );
        node.flush().unwrap();
    }

    for node in &nodes {
        node.stop().await;
    }
}
