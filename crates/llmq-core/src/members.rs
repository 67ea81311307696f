//! Deterministic quorum membership.
//!
//! Every node must derive the same ordered member list for a quorum from
//! nothing but chain state: masternodes are ranked by
//! `sha256d(pro_tx_hash || modifier)` where the modifier commits to the
//! quorum type and the quorum block hash, and the lowest `size` scores win.

use crate::params::{LlmqParams, LlmqType};
use crate::provider::{BlockRef, Masternode, MasternodeListProvider};
use crate::{Hash256, HashWriter};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Member lists kept around for recent quorum blocks.
const MEMBER_CACHE_SIZE: usize = 10;

/// Per-quorum selection modifier.
pub fn quorum_modifier(llmq_type: LlmqType, block_hash: &Hash256) -> Hash256 {
    let mut w = HashWriter::new();
    w.write_u8(llmq_type.0).write_hash(block_hash);
    w.finish()
}

/// Rank `masternodes` for a quorum and keep the best `size`.
pub fn calculate_quorum(masternodes: &[Masternode], modifier: &Hash256, size: usize) -> Vec<Masternode> {
    let mut scored: Vec<(Hash256, &Masternode)> = masternodes
        .iter()
        .map(|mn| {
            let mut w = HashWriter::new();
            w.write_hash(&mn.pro_tx_hash).write_hash(modifier);
            (w.finish(), mn)
        })
        .collect();
    // pro_tx_hash breaks (practically impossible) score ties deterministically
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.pro_tx_hash.cmp(&b.1.pro_tx_hash)));
    scored.into_iter().take(size).map(|(_, mn)| mn.clone()).collect()
}

/// Cached member list derivation shared by DKG and quorum building.
pub struct QuorumMembers {
    mn_list: Arc<dyn MasternodeListProvider>,
    cache: Mutex<IndexMap<(LlmqType, Hash256), Arc<Vec<Masternode>>>>,
}

impl QuorumMembers {
    /// Wrap a masternode list provider.
    pub fn new(mn_list: Arc<dyn MasternodeListProvider>) -> Self {
        Self {
            mn_list,
            cache: Mutex::new(IndexMap::new()),
        }
    }

    /// Ordered members of the quorum defined by `block`.
    pub fn members(&self, params: &LlmqParams, block: &BlockRef) -> Arc<Vec<Masternode>> {
        let key = (params.llmq_type, block.hash);
        {
            let mut cache = self.cache.lock();
            if let Some(members) = cache.shift_remove(&key) {
                // Re-insert at the back so recently used entries survive
                cache.insert(key, Arc::clone(&members));
                return members;
            }
        }

        let masternodes = self.mn_list.valid_masternodes(block);
        let modifier = quorum_modifier(params.llmq_type, &block.hash);
        let members = Arc::new(calculate_quorum(&masternodes, &modifier, params.size));
        tracing::trace!(
            llmq_type = %params.llmq_type,
            quorum_hash = %block.hash,
            members = members.len(),
            "Calculated quorum members"
        );

        let mut cache = self.cache.lock();
        cache.insert(key, Arc::clone(&members));
        while cache.len() > MEMBER_CACHE_SIZE {
            cache.shift_remove_index(0);
        }
        members
    }

    /// Position of `pro_tx_hash` in the quorum, if it is a member.
    pub fn member_index(&self, params: &LlmqParams, block: &BlockRef, pro_tx_hash: &Hash256) -> Option<usize> {
        self.members(params, block)
            .iter()
            .position(|m| &m.pro_tx_hash == pro_tx_hash)
    }
}
