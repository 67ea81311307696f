//! Persistent store of verified DKG contributions.
//!
//! After a round commits, each member keeps the verification vector of every
//! valid dealer and the secret key share each dealer sent it. Quorum
//! building later aggregates these into the quorum verification vector and
//! the local secret key share.

use llmq_core::{Hash256, LlmqType, Result, SecretKey, VerificationVector};
use llmq_store::{BoundedPersistentCache, KeyValueStore};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
struct ContributionKey {
    llmq_type: LlmqType,
    quorum_hash: Hash256,
    pro_tx_hash: Hash256,
}

/// Verified verification vectors and secret key contributions per dealer.
pub struct ContributionStore {
    vvecs: BoundedPersistentCache<ContributionKey, VerificationVector>,
    sk_contributions: BoundedPersistentCache<ContributionKey, SecretKey>,
}

impl ContributionStore {
    /// Store backed by `store`. Entries are never evicted before a flush.
    pub fn new(store: Arc<dyn KeyValueStore>, flush_chunk_size: usize) -> Self {
        Self {
            vvecs: BoundedPersistentCache::new("dkg_vvec", Arc::clone(&store), 0).with_chunk_size(flush_chunk_size),
            sk_contributions: BoundedPersistentCache::new("dkg_skcontrib", store, 0)
                .with_chunk_size(flush_chunk_size),
        }
    }

    fn key(llmq_type: LlmqType, quorum_hash: Hash256, pro_tx_hash: Hash256) -> ContributionKey {
        ContributionKey {
            llmq_type,
            quorum_hash,
            pro_tx_hash,
        }
    }

    /// Record the verification vector dealt by `pro_tx_hash`.
    pub fn write_verified_vvec_contribution(
        &self,
        llmq_type: LlmqType,
        quorum_hash: Hash256,
        pro_tx_hash: Hash256,
        vvec: VerificationVector,
    ) {
        self.vvecs
            .write_cache(Self::key(llmq_type, quorum_hash, pro_tx_hash), vvec);
    }

    /// Record the secret key share `pro_tx_hash` dealt to us.
    pub fn write_verified_sk_contribution(
        &self,
        llmq_type: LlmqType,
        quorum_hash: Hash256,
        pro_tx_hash: Hash256,
        sk: SecretKey,
    ) {
        self.sk_contributions
            .write_cache(Self::key(llmq_type, quorum_hash, pro_tx_hash), sk);
    }

    /// Verification vector dealt by `pro_tx_hash`.
    pub fn read_vvec_contribution(
        &self,
        llmq_type: LlmqType,
        quorum_hash: Hash256,
        pro_tx_hash: Hash256,
    ) -> Result<Option<VerificationVector>> {
        self.vvecs
            .read_cache(&Self::key(llmq_type, quorum_hash, pro_tx_hash))
    }

    /// Secret key share `pro_tx_hash` dealt to us.
    pub fn read_sk_contribution(
        &self,
        llmq_type: LlmqType,
        quorum_hash: Hash256,
        pro_tx_hash: Hash256,
    ) -> Result<Option<SecretKey>> {
        self.sk_contributions
            .read_cache(&Self::key(llmq_type, quorum_hash, pro_tx_hash))
    }

    /// Persist everything buffered.
    pub fn flush(&self) -> Result<()> {
        self.vvecs.flush_cache_to_disk()?;
        self.sk_contributions.flush_cache_to_disk()
    }
}

impl std::fmt::Debug for ContributionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContributionStore").finish_non_exhaustive()
    }
}
