//! Mineable and mined final commitments.
//!
//! Commitments produced by DKG (locally or relayed by peers) wait in the
//! mineable pool, one per quorum hash, until a miner picks them up. Once a
//! block carrying a commitment is processed, the commitment is recorded as
//! mined together with the hash of that block and becomes the canonical
//! result for its quorum.
//!
//! Inside the mining window of an interval every block must carry exactly
//! one commitment (a null one while nothing better is known) until the
//! first non-null commitment is mined; after that, and outside the window,
//! blocks must carry none.

use llmq_core::{
    BlockRef, ChainView, FinalCommitment, Hash256, LlmqError, LlmqParams, MessageHandler, MessageKind, PeerId,
    PeerMessenger, QuorumMembers, Result,
};
use llmq_dkg::CommitmentSink;
use llmq_store::{BoundedPersistentCache, KeyValueStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Score reported for peers relaying invalid commitments.
const MISBEHAVING_SCORE: u32 = 100;

#[derive(Default)]
struct MineablePool {
    by_quorum: BTreeMap<Hash256, Hash256>,
    commitments: BTreeMap<Hash256, FinalCommitment>,
}

/// Commitment bookkeeping for the chain-lock quorum type.
pub struct CommitmentLedger {
    params: LlmqParams,
    chain: Arc<dyn ChainView>,
    members: Arc<QuorumMembers>,
    messenger: Arc<dyn PeerMessenger>,
    mineable: Mutex<MineablePool>,
    mined: BoundedPersistentCache<Hash256, (FinalCommitment, Hash256)>,
}

impl CommitmentLedger {
    /// Ledger for commitments of `params`, persisting mined commitments in
    /// `store`.
    pub fn new(
        params: LlmqParams,
        chain: Arc<dyn ChainView>,
        members: Arc<QuorumMembers>,
        messenger: Arc<dyn PeerMessenger>,
        store: Arc<dyn KeyValueStore>,
        flush_chunk_size: usize,
    ) -> Self {
        Self {
            params,
            chain,
            members,
            messenger,
            mineable: Mutex::new(MineablePool::default()),
            mined: BoundedPersistentCache::new("qc_mined", store, 0).with_chunk_size(flush_chunk_size),
        }
    }

    /// Parameters of the ledger's quorum type.
    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    /// Whether `height` lies in the mining window of its interval.
    pub fn is_mining_phase(&self, height: u32) -> bool {
        let stage = height % self.params.dkg_interval;
        stage >= self.params.dkg_mining_window_start && stage <= self.params.dkg_mining_window_end
    }

    /// Whether a block at `height` (on top of the current tip) must carry a
    /// commitment.
    pub fn is_commitment_required(&self, height: u32) -> Result<bool> {
        if !self.is_mining_phase(height) {
            return Ok(false);
        }
        match self.quorum_block_for_height(height) {
            Some(quorum) => Ok(!self.has_mined_commitment(&quorum.hash)?),
            None => Ok(false),
        }
    }

    /// Quorum block of the interval `height` falls in, looked up from the
    /// tip. The block at `height` itself need not exist yet.
    fn quorum_block_for_height(&self, height: u32) -> Option<BlockRef> {
        let quorum_height = self.params.quorum_height(height);
        let tip = self.chain.tip()?;
        self.chain.ancestor(&tip, quorum_height)
    }

    fn quorum_block_of(&self, block: &BlockRef) -> Option<BlockRef> {
        self.chain.ancestor(block, self.params.quorum_height(block.height))
    }

    /// Verify `commitment` against its quorum block and members.
    fn verify_commitment(&self, commitment: &FinalCommitment) -> bool {
        let Some(quorum) = self.chain.block_by_hash(&commitment.quorum_hash) else {
            debug!(quorum_hash = %commitment.quorum_hash, "Commitment for unknown block");
            return false;
        };
        let members = self.members.members(&self.params, &quorum);
        commitment.verify(&quorum, &members, &self.params, true)
    }

    fn insert_mineable(&self, commitment: FinalCommitment) -> Option<Hash256> {
        let hash = commitment.hash();
        let mut pool = self.mineable.lock();
        match pool.by_quorum.get(&commitment.quorum_hash).copied() {
            None => {
                pool.by_quorum.insert(commitment.quorum_hash, hash);
            }
            Some(old_hash) => {
                let old_signers = pool.commitments.get(&old_hash).map_or(0, FinalCommitment::count_signers);
                if commitment.count_signers() <= old_signers {
                    return None;
                }
                pool.commitments.remove(&old_hash);
                pool.by_quorum.insert(commitment.quorum_hash, hash);
            }
        }
        debug!(
            quorum_hash = %commitment.quorum_hash,
            commitment = %hash,
            signers = commitment.count_signers(),
            "Added mineable commitment"
        );
        pool.commitments.insert(hash, commitment);
        Some(hash)
    }

    /// Whether the mineable pool holds the commitment with wire hash `hash`.
    pub fn has_mineable_commitment(&self, hash: &Hash256) -> bool {
        self.mineable.lock().commitments.contains_key(hash)
    }

    /// Mineable commitment with wire hash `hash`.
    pub fn get_mineable_commitment_by_hash(&self, hash: &Hash256) -> Option<FinalCommitment> {
        self.mineable.lock().commitments.get(hash).cloned()
    }

    /// Commitment a block at `height` should carry: the best known one, a
    /// null commitment while none is known, or `None` when the block must
    /// not carry any.
    pub fn get_mineable_commitment(&self, height: u32) -> Result<Option<FinalCommitment>> {
        if !self.is_commitment_required(height)? {
            return Ok(None);
        }
        let Some(quorum) = self.quorum_block_for_height(height) else {
            return Ok(None);
        };
        let pool = self.mineable.lock();
        let best = pool
            .by_quorum
            .get(&quorum.hash)
            .and_then(|hash| pool.commitments.get(hash))
            .cloned();
        Ok(Some(best.unwrap_or_else(|| FinalCommitment::null(&self.params, quorum.hash))))
    }

    /// Validate the commitments carried by `block` and record the non-null
    /// one as mined.
    pub fn process_block(&self, block: &BlockRef, commitments: &[FinalCommitment]) -> Result<()> {
        if commitments.len() > 1 {
            return Err(LlmqError::invalid(format!(
                "bad-qc-dup: {} commitments in block {}",
                commitments.len(),
                block.hash
            )));
        }

        let required = if self.is_mining_phase(block.height) {
            match self.quorum_block_of(block) {
                Some(quorum) => !self.has_mined_commitment(&quorum.hash)?,
                None => false,
            }
        } else {
            false
        };

        match (commitments.first(), required) {
            (None, false) => Ok(()),
            (None, true) => Err(LlmqError::invalid(format!(
                "bad-qc-missing: block {} at height {} must carry a commitment",
                block.hash, block.height
            ))),
            (Some(_), false) => Err(LlmqError::invalid(format!(
                "bad-qc-not-allowed: block {} at height {} must not carry a commitment",
                block.hash, block.height
            ))),
            (Some(commitment), true) => self.process_commitment(block, commitment),
        }
    }

    fn process_commitment(&self, block: &BlockRef, commitment: &FinalCommitment) -> Result<()> {
        let quorum = self
            .quorum_block_of(block)
            .filter(|quorum| quorum.hash == commitment.quorum_hash)
            .ok_or_else(|| {
                LlmqError::invalid(format!(
                    "bad-qc-block: commitment for {} is not the quorum block of height {}",
                    commitment.quorum_hash, block.height
                ))
            })?;

        if commitment.is_null() {
            if !commitment.verify_null(&self.params) {
                return Err(LlmqError::invalid(format!(
                    "bad-qc-invalid-null: null commitment for {}",
                    quorum.hash
                )));
            }
            return Ok(());
        }

        if self.has_mined_commitment(&quorum.hash)? {
            return Err(LlmqError::invalid(format!("bad-qc-dup: {} already mined", quorum.hash)));
        }
        if !self.is_mining_phase(block.height) {
            return Err(LlmqError::invalid(format!(
                "bad-qc-height: height {} is outside the mining window",
                block.height
            )));
        }
        let members = self.members.members(&self.params, &quorum);
        if !commitment.verify(&quorum, &members, &self.params, true) {
            return Err(LlmqError::invalid(format!(
                "bad-qc-invalid: commitment for {} failed verification",
                quorum.hash
            )));
        }

        self.mined
            .write_cache(commitment.quorum_hash, (commitment.clone(), block.hash));
        {
            let mut pool = self.mineable.lock();
            if let Some(hash) = pool.by_quorum.remove(&commitment.quorum_hash) {
                pool.commitments.remove(&hash);
            }
        }

        info!(
            llmq_type = %self.params.llmq_type,
            quorum_hash = %commitment.quorum_hash,
            block = %block.hash,
            height = block.height,
            signers = commitment.count_signers(),
            valid_members = commitment.count_valid_members(),
            "Processed final commitment"
        );
        Ok(())
    }

    /// Forget the commitments mined in `block` and offer them for mining
    /// again.
    pub fn undo_block(&self, block: &BlockRef, commitments: &[FinalCommitment]) -> Result<()> {
        for commitment in commitments.iter().filter(|c| !c.is_null()) {
            match self.mined.read_cache(&commitment.quorum_hash)? {
                Some((_, mined_in)) if mined_in == block.hash => {
                    self.mined.erase_cache(&commitment.quorum_hash);
                    debug!(quorum_hash = %commitment.quorum_hash, block = %block.hash, "Undid mined commitment");
                    self.insert_mineable(commitment.clone());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether a commitment for `quorum_hash` has been mined.
    pub fn has_mined_commitment(&self, quorum_hash: &Hash256) -> Result<bool> {
        self.mined.exists_cache(quorum_hash)
    }

    /// Mined commitment for `quorum_hash` and the hash of the block it was
    /// mined in.
    pub fn get_mined_commitment(&self, quorum_hash: &Hash256) -> Result<Option<(FinalCommitment, Hash256)>> {
        self.mined.read_cache(quorum_hash)
    }

    /// Persist mined commitments.
    pub fn flush_cache_to_disk(&self) -> Result<()> {
        self.mined.flush_cache_to_disk()
    }

    fn process_final_commitment(&self, peer: PeerId, payload: &[u8]) {
        let commitment = match FinalCommitment::decode(payload) {
            Ok(c) => c,
            Err(e) => {
                self.messenger.misbehaving(peer, MISBEHAVING_SCORE, "undecodable final commitment");
                debug!(%peer, error = %e, "Undecodable final commitment");
                return;
            }
        };
        if commitment.is_null() {
            self.messenger.misbehaving(peer, MISBEHAVING_SCORE, "relayed null commitment");
            return;
        }

        // Unknown or inactive blocks can't be judged yet
        let Some(quorum) = self.chain.block_by_hash(&commitment.quorum_hash) else {
            debug!(%peer, quorum_hash = %commitment.quorum_hash, "Commitment for unknown block");
            return;
        };
        if !self.chain.is_active(&quorum) {
            debug!(%peer, quorum_hash = %commitment.quorum_hash, "Commitment for block not in the active chain");
            return;
        }
        if quorum.height % self.params.dkg_interval != 0 {
            self.messenger
                .misbehaving(peer, MISBEHAVING_SCORE, "commitment for a block that starts no interval");
            return;
        }

        // Cheap checks first: a better or equal commitment is already known
        {
            let pool = self.mineable.lock();
            let known = pool
                .by_quorum
                .get(&commitment.quorum_hash)
                .and_then(|hash| pool.commitments.get(hash));
            if known.is_some_and(|known| known.count_signers() >= commitment.count_signers()) {
                trace!(%peer, quorum_hash = %commitment.quorum_hash, "Already have a better commitment");
                return;
            }
        }
        match self.has_mined_commitment(&commitment.quorum_hash) {
            Ok(false) => {}
            // Late but not malicious
            Ok(true) => return,
            Err(e) => {
                debug!(error = %e, "Failed to look up mined commitment");
                return;
            }
        }

        let members = self.members.members(&self.params, &quorum);
        if !commitment.verify(&quorum, &members, &self.params, true) {
            self.messenger.misbehaving(peer, MISBEHAVING_SCORE, "invalid final commitment");
            return;
        }
        if self.insert_mineable(commitment).is_some() {
            self.messenger
                .relay(MessageKind::FinalCommitment, payload.to_vec());
        }
    }
}

impl CommitmentSink for CommitmentLedger {
    fn add_mineable_commitment(&self, commitment: FinalCommitment) -> Option<Hash256> {
        if !self.verify_commitment(&commitment) {
            debug!(quorum_hash = %commitment.quorum_hash, "Rejected mineable commitment");
            return None;
        }
        self.insert_mineable(commitment)
    }
}

impl MessageHandler for CommitmentLedger {
    fn process_message(&self, peer: PeerId, kind: MessageKind, payload: &[u8]) {
        if kind == MessageKind::FinalCommitment {
            self.process_final_commitment(peer, payload);
        }
    }
}

impl std::fmt::Debug for CommitmentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitmentLedger")
            .field("llmq_type", &self.params.llmq_type)
            .field("mined", &self.mined)
            .finish_non_exhaustive()
    }
}
