//! Quorum lookup, building and caching.
//!
//! A quorum exists once its commitment is mined. On first lookup it is
//! materialized: members are derived, the aggregate verification vector
//! and local key share are read from the persistent caches or rebuilt from
//! the verified DKG contributions, and a background job warms the public
//! key share cache. The newest [`QUORUM_CACHE_SIZE`] quorums stay in a
//! memory ring.
//!
//! The mined-commitment check always runs before the ring is consulted, so
//! a quorum orphaned by a reorg is never served from memory.

use crate::ledger::CommitmentLedger;
use crate::quorum::Quorum;
use llmq_core::connections::{deterministic_outbound_connection, quorum_relay_members};
use llmq_core::{
    BlockRef, ChainView, Hash256, HashWriter, InterruptToken, LlmqConfig, LlmqError, LlmqParams, PeerMessenger,
    QuorumMembers, Result, SecretKey, VerificationVector,
};
use llmq_crypto::CryptoWorker;
use llmq_dkg::{valid_set_key, DkgSessionManager};
use llmq_store::{BoundedPersistentCache, KeyValueStore};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Quorums kept in memory, and the FIFO bound of the key caches.
pub const QUORUM_CACHE_SIZE: usize = 10;

/// Collaborators of the quorum manager.
#[derive(Clone)]
pub struct QuorumManagerDeps {
    /// Block index
    pub chain: Arc<dyn ChainView>,
    /// Member derivation
    pub members: Arc<QuorumMembers>,
    /// Mined commitments
    pub ledger: Arc<CommitmentLedger>,
    /// Source of verified contributions
    pub dkg: Arc<DkgSessionManager>,
    /// Crypto offload
    pub worker: Arc<CryptoWorker>,
    /// Connection management
    pub messenger: Arc<dyn PeerMessenger>,
    /// Persistent storage
    pub store: Arc<dyn KeyValueStore>,
    /// Local masternode, if any
    pub local: Option<Hash256>,
    /// Shutdown signal
    pub interrupt: InterruptToken,
}

/// Builds, caches and scans quorums of the chain-lock type.
pub struct QuorumManager {
    params: LlmqParams,
    deps: QuorumManagerDeps,
    quorums: Mutex<VecDeque<Arc<Quorum>>>,
    vvec_cache: BoundedPersistentCache<Hash256, VerificationVector>,
    sk_cache: BoundedPersistentCache<Hash256, SecretKey>,
}

impl QuorumManager {
    /// Manager for the chain-lock quorum type of `config`.
    pub fn new(config: &LlmqConfig, deps: QuorumManagerDeps) -> Result<Self> {
        let params = config.chainlock_params().cloned().ok_or_else(|| {
            LlmqError::invalid(format!("chainlock type {} has no parameter set", config.chainlock_type))
        })?;
        let vvec_cache = BoundedPersistentCache::new("q_vvec", Arc::clone(&deps.store), config.cache_bound)
            .with_chunk_size(config.flush_chunk_size);
        let sk_cache = BoundedPersistentCache::new("q_sk", Arc::clone(&deps.store), config.cache_bound)
            .with_chunk_size(config.flush_chunk_size);
        Ok(Self {
            params,
            deps,
            quorums: Mutex::new(VecDeque::with_capacity(QUORUM_CACHE_SIZE)),
            vvec_cache,
            sk_cache,
        })
    }

    /// Parameters of the managed quorum type.
    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    pub(crate) fn chain(&self) -> &Arc<dyn ChainView> {
        &self.deps.chain
    }

    pub(crate) fn worker(&self) -> &Arc<CryptoWorker> {
        &self.deps.worker
    }

    /// Whether a commitment for `quorum_hash` is mined.
    pub fn has_quorum(&self, quorum_hash: &Hash256) -> Result<bool> {
        self.deps.ledger.has_mined_commitment(quorum_hash)
    }

    /// Quorum defined by block `quorum_hash`.
    pub fn get_quorum(&self, quorum_hash: &Hash256) -> Result<Arc<Quorum>> {
        let block = self
            .deps
            .chain
            .block_by_hash(quorum_hash)
            .ok_or_else(|| LlmqError::not_found(format!("block {quorum_hash}")))?;
        self.get_quorum_at(&block)
    }

    /// Quorum defined by `block`.
    pub fn get_quorum_at(&self, block: &BlockRef) -> Result<Arc<Quorum>> {
        // Reorgs may have orphaned cached quorums
        if !self.has_quorum(&block.hash)? {
            return Err(LlmqError::not_found(format!("no mined commitment for quorum {}", block.hash)));
        }
        if let Some(quorum) = self
            .quorums
            .lock()
            .iter()
            .find(|q| q.quorum_hash() == block.hash)
        {
            return Ok(Arc::clone(quorum));
        }
        self.build_quorum(block)
    }

    fn build_quorum(&self, block: &BlockRef) -> Result<Arc<Quorum>> {
        let (commitment, mined_block_hash) = self
            .deps
            .ledger
            .get_mined_commitment(&block.hash)?
            .ok_or_else(|| LlmqError::not_found(format!("no mined commitment for quorum {}", block.hash)))?;
        let members = self.deps.members.members(&self.params, block);
        let quorum = Arc::new(Quorum::new(
            self.params.clone(),
            *block,
            mined_block_hash,
            commitment,
            members,
            self.deps.local,
            Arc::clone(&self.deps.worker),
        ));

        let has_vvec = if self.read_contributions(&quorum)? {
            true
        } else if self.build_contributions(&quorum) {
            self.write_contributions(&quorum);
            true
        } else {
            debug!(quorum_hash = %block.hash, "No verification vector for quorum");
            false
        };
        if has_vvec {
            self.start_cache_populator(Arc::clone(&quorum));
        }

        let mut quorums = self.quorums.lock();
        if quorums.len() >= QUORUM_CACHE_SIZE {
            quorums.pop_front();
        }
        quorums.push_back(Arc::clone(&quorum));
        Ok(quorum)
    }

    fn read_contributions(&self, quorum: &Quorum) -> Result<bool> {
        let key = quorum.storage_key();
        let Some(vvec) = self.vvec_cache.read_cache(&key)? else {
            return Ok(false);
        };
        if !quorum.set_verification_vector(vvec) {
            return Ok(false);
        }
        // A missing share only means we were not a member
        if let Some(sk) = self.sk_cache.read_cache(&key)? {
            if !quorum.set_secret_key_share(sk) {
                warn!(quorum_hash = %quorum.quorum_hash(), "Stored secret key share does not match quorum");
            }
        }
        Ok(true)
    }

    fn write_contributions(&self, quorum: &Quorum) {
        let key = quorum.storage_key();
        if let Some(vvec) = quorum.verification_vector() {
            self.vvec_cache.write_cache(key, vvec.as_ref().clone());
        }
        if let Some(sk) = quorum.get_secret_key_share() {
            self.sk_cache.write_cache(key, sk);
        }
    }

    /// Aggregate the verified DKG contributions of the valid members.
    fn build_contributions(&self, quorum: &Quorum) -> bool {
        let llmq_type = self.params.llmq_type;
        let valid_members = &quorum.commitment().valid_members;
        let dkg = &self.deps.dkg;
        let Some((_, vvecs, sk_contributions)) =
            dkg.get_verified_contributions(llmq_type, &quorum.quorum_block(), valid_members)
        else {
            return false;
        };

        let started = Instant::now();
        let key = valid_set_key(llmq_type, &quorum.quorum_hash(), valid_members);
        let worker = &self.deps.worker;
        let Some(vvec) = worker.get_or_build_quorum_verification_vector(key, &vvecs, true) else {
            debug!(quorum_hash = %quorum.quorum_hash(), "Failed to build quorum verification vector");
            return false;
        };
        if !quorum.set_verification_vector(vvec) {
            warn!(quorum_hash = %quorum.quorum_hash(), "Built verification vector does not match commitment");
            return false;
        }

        // The vvec alone still allows deriving public key shares
        if let Some(local) = self.deps.local {
            let mut w = HashWriter::new();
            w.write_hash(&key).write_hash(&local);
            let built = worker.get_or_aggregate_secret_keys(w.finish(), &sk_contributions, true);
            if !built.is_some_and(|sk| quorum.set_secret_key_share(sk)) {
                warn!(quorum_hash = %quorum.quorum_hash(), "Failed to build secret key share");
            }
        }

        debug!(
            quorum_hash = %quorum.quorum_hash(),
            elapsed = ?started.elapsed(),
            "Built quorum verification vector and key share"
        );
        true
    }

    fn start_cache_populator(&self, quorum: Arc<Quorum>) {
        let interrupt = self.deps.interrupt.clone();
        let started = Instant::now();
        self.deps.worker.spawn(move || {
            let valid: Vec<usize> = quorum.commitment().valid_members.iter_ones().collect();
            for idx in valid {
                if interrupt.is_interrupted() {
                    break;
                }
                quorum.get_pub_key_share(idx);
            }
            debug!(
                quorum_hash = %quorum.quorum_hash(),
                elapsed = ?started.elapsed(),
                "Populated public key share cache"
            );
        });
    }

    /// Up to `count` quorums, newest first, starting at the interval of
    /// `from` and walking back one DKG interval at a time.
    pub fn scan_quorums(&self, from: &BlockRef, count: usize) -> Vec<Arc<Quorum>> {
        let mut result = Vec::with_capacity(count);
        if count == 0 {
            return result;
        }
        let interval = self.params.dkg_interval;
        let mut cursor = self.deps.chain.ancestor(from, from.height - from.height % interval);
        while result.len() < count {
            let Some(block) = cursor else {
                break;
            };
            match self.get_quorum_at(&block) {
                Ok(quorum) => result.push(quorum),
                Err(LlmqError::NotFound { .. }) => {}
                Err(e) => warn!(quorum_hash = %block.hash, error = %e, "Failed to load quorum"),
            }
            if block.height < interval {
                break;
            }
            cursor = self.deps.chain.ancestor(&block, block.height - interval);
        }
        result
    }

    /// [`Self::scan_quorums`] from the active tip.
    pub fn scan_quorums_from_tip(&self, count: usize) -> Vec<Arc<Quorum>> {
        match self.deps.chain.tip() {
            Some(tip) => self.scan_quorums(&tip, count),
            None => Vec::new(),
        }
    }

    /// Keep connections to the relay members of recent quorums we belong
    /// to. Connection sets of scanned quorums we cannot serve are dropped;
    /// the running DKG round keeps its set, and sets of quorums outside the
    /// scan are left alone.
    pub fn ensure_quorum_connections(&self, tip: &BlockRef) {
        let Some(local) = self.deps.local else {
            return;
        };
        let llmq_type = self.params.llmq_type;
        let messenger = &self.deps.messenger;
        let mut removable = messenger.quorum_nodes(llmq_type);
        if let Some(current) = self.deps.chain.ancestor(tip, self.params.quorum_height(tip.height)) {
            removable.remove(&current.hash);
        }

        for quorum in self.scan_quorums(tip, self.params.keep_old_connections) {
            let quorum_hash = quorum.quorum_hash();
            if quorum.is_member(&local) {
                let connections: BTreeSet<Hash256> = quorum_relay_members(quorum.members(), &local, false)
                    .into_iter()
                    .filter(|other| deterministic_outbound_connection(&local, other) == local)
                    .collect();
                if !connections.is_empty() {
                    debug!(%quorum_hash, connections = connections.len(), "Ensuring quorum connections");
                    messenger.set_quorum_nodes(llmq_type, quorum_hash, connections);
                    continue;
                }
            }
            if removable.contains(&quorum_hash) {
                debug!(%quorum_hash, "Removing quorum connections");
                messenger.remove_quorum_nodes(llmq_type, quorum_hash);
            }
        }
    }

    /// React to a new active tip.
    pub fn updated_block_tip(&self, tip: &BlockRef) {
        self.ensure_quorum_connections(tip);
    }

    /// Rebuild full key caches: wipe their persisted data and keep only
    /// what is still buffered.
    pub fn do_maintenance(&self) -> Result<()> {
        rebuild_if_full(&self.vvec_cache)?;
        rebuild_if_full(&self.sk_cache)
    }

    /// Run maintenance, then persist both key caches under a joint lock.
    pub fn flush_cache_to_disk(&self) -> Result<()> {
        self.do_maintenance()?;
        let _vvec_guard = self.vvec_cache.lock();
        let _sk_guard = self.sk_cache.lock();
        self.vvec_cache.flush_cache_to_disk()?;
        self.sk_cache.flush_cache_to_disk()
    }

    /// Number of quorums in the memory ring.
    pub fn cached_quorums(&self) -> usize {
        self.quorums.lock().len()
    }
}

fn rebuild_if_full<V>(cache: &BoundedPersistentCache<Hash256, V>) -> Result<()>
where
    V: Serialize + DeserializeOwned + Clone,
{
    let _guard = cache.lock();
    if cache.is_cache_full() {
        let entries = cache.get_map_cache_copy()?;
        let erased = cache.get_erase_cache_copy();
        cache.wipe()?;
        cache.restore_caches(entries, erased);
        info!(cache = cache.name(), "Cache database wiped and recreated");
    }
    Ok(())
}

impl std::fmt::Debug for QuorumManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumManager")
            .field("llmq_type", &self.params.llmq_type)
            .field("cached_quorums", &self.cached_quorums())
            .finish_non_exhaustive()
    }
}
