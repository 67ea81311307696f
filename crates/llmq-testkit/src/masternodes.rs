//! Static masternode list with known operator keys.

use llmq_core::members::{calculate_quorum, quorum_modifier};
use llmq_core::{ActiveMasternode, BlockRef, Hash256, LlmqParams, Masternode, MasternodeListProvider, SecretKey};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// The same masternodes at every block.
#[derive(Debug, Clone)]
pub struct MockMasternodeList {
    nodes: Vec<ActiveMasternode>,
}

impl MockMasternodeList {
    /// `n` masternodes with keys derived from `seed`.
    pub fn generate(n: usize, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let nodes = (0..n)
            .map(|i| ActiveMasternode {
                pro_tx_hash: Hash256::sha256d(format!("protx-{seed}-{i}").as_bytes()),
                operator_key: SecretKey::random(&mut rng),
            })
            .collect();
        Self { nodes }
    }

    /// All nodes including their secret keys.
    pub fn nodes(&self) -> &[ActiveMasternode] {
        &self.nodes
    }

    /// Secret identity of `pro_tx_hash`.
    pub fn active(&self, pro_tx_hash: &Hash256) -> Option<&ActiveMasternode> {
        self.nodes.iter().find(|n| &n.pro_tx_hash == pro_tx_hash)
    }

    /// Quorum members of `block` in quorum order, with secrets.
    pub fn ordered_quorum(&self, params: &LlmqParams, block: &BlockRef) -> Vec<ActiveMasternode> {
        let modifier = quorum_modifier(params.llmq_type, &block.hash);
        calculate_quorum(&self.valid_masternodes(block), &modifier, params.size)
            .iter()
            .filter_map(|m| self.active(&m.pro_tx_hash).cloned())
            .collect()
    }
}

impl MasternodeListProvider for MockMasternodeList {
    fn valid_masternodes(&self, _block: &BlockRef) -> Vec<Masternode> {
        self.nodes.iter().map(ActiveMasternode::to_masternode).collect()
    }
}
