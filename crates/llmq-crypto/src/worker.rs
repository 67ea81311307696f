//! Thread-pooled BLS work for DKG and quorum building.
//!
//! [`CryptoWorker`] owns a rayon pool. Aggregations over many inputs are
//! split into balanced batches, aggregated concurrently, then combined;
//! because aggregation is plain addition in the group, the result matches a
//! sequential sum. Signing and signature verification are also offered
//! asynchronously: results arrive over `futures::channel::oneshot`, or
//! through a callback, and a dropped sender resolves to the failure value.
//!
//! Invalid inputs never produce errors here. They produce `false`, `None`
//! or an empty result.

use crate::result_cache::ResultCache;
use crate::verify_queue::{CancelCheck, VerifyJob, VerifyQueue};
use futures::channel::oneshot;
use llmq_core::bls::{aggregate_verification_vectors, verification_vector_hash};
use llmq_core::{BlsId, Hash256, LlmqConfig, LlmqError, PublicKey, SecretKey, Signature, VerificationVector};
use rand::{CryptoRng, RngCore};
use rayon::prelude::*;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Inputs at or below this size are aggregated on the calling thread.
const MIN_PARALLEL_BATCH: usize = 16;

/// Contribution shares checked as one aggregate before falling back to
/// per-share verification.
pub const CONTRIBUTION_VERIFY_BATCH_SIZE: usize = 8;

/// Errors from worker pool construction.
#[derive(Debug, Error)]
pub enum WorkerPoolError {
    /// Rayon refused to build the pool
    #[error("Failed to build rayon thread pool: {0}")]
    RayonBuildError(String),

    /// Requested zero threads
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<WorkerPoolError> for LlmqError {
    fn from(err: WorkerPoolError) -> Self {
        LlmqError::internal(err.to_string())
    }
}

/// Pooled BLS aggregation, share derivation, signing and verification.
pub struct CryptoWorker {
    pool: Arc<rayon::ThreadPool>,
    threads: usize,
    verify_queue: Arc<VerifyQueue>,
    vvec_cache: ResultCache<Hash256, Option<VerificationVector>>,
    sk_cache: ResultCache<Hash256, Option<SecretKey>>,
    pk_share_cache: ResultCache<(Hash256, BlsId), Option<PublicKey>>,
}

impl CryptoWorker {
    /// Pool with `threads` workers.
    pub fn new(threads: usize) -> Result<Self, WorkerPoolError> {
        if threads == 0 {
            return Err(WorkerPoolError::InvalidConfig("worker needs at least one thread".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("llmq-crypto-{i}"))
            .panic_handler(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(reason = %reason, "Crypto worker job panicked");
            })
            .build()
            .map_err(|e| WorkerPoolError::RayonBuildError(e.to_string()))?;
        let pool = Arc::new(pool);
        debug!(threads, "Started crypto worker pool");
        Ok(Self {
            verify_queue: VerifyQueue::new(Arc::clone(&pool)),
            pool,
            threads,
            vvec_cache: ResultCache::new(),
            sk_cache: ResultCache::new(),
            pk_share_cache: ResultCache::new(),
        })
    }

    /// Pool sized from `config.worker_threads` (zero = one per core).
    pub fn from_config(config: &LlmqConfig) -> Result<Self, WorkerPoolError> {
        Self::new(config.resolved_worker_threads())
    }

    /// Number of pool threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run a closure on the pool without waiting for it.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(f);
    }

    fn aggregate_batched<T, F>(&self, items: &[T], parallel: bool, aggregate: F) -> Option<T>
    where
        T: Send + Sync,
        F: Fn(&[T]) -> Option<T> + Send + Sync,
    {
        if items.is_empty() {
            return None;
        }
        if !parallel || items.len() <= MIN_PARALLEL_BATCH {
            return aggregate(items);
        }
        let batch = items.len().div_ceil(self.threads).max(MIN_PARALLEL_BATCH);
        let partials: Option<Vec<T>> = self
            .pool
            .install(|| items.par_chunks(batch).map(|chunk| aggregate(chunk)).collect());
        aggregate(&partials?)
    }

    /// Sum of secret key shares.
    pub fn aggregate_secret_keys(&self, shares: &[SecretKey], parallel: bool) -> Option<SecretKey> {
        self.aggregate_batched(shares, parallel, SecretKey::aggregate)
    }

    /// Sum of public keys.
    pub fn aggregate_public_keys(&self, keys: &[PublicKey], parallel: bool) -> Option<PublicKey> {
        self.aggregate_batched(keys, parallel, PublicKey::aggregate)
    }

    /// Sum of signatures.
    pub fn aggregate_signatures(&self, sigs: &[Signature], parallel: bool) -> Option<Signature> {
        self.aggregate_batched(sigs, parallel, Signature::aggregate)
    }

    /// Element-wise sum of verification vectors.
    pub fn build_quorum_verification_vector(
        &self,
        vvecs: &[VerificationVector],
        parallel: bool,
    ) -> Option<VerificationVector> {
        let len = vvecs.first()?.len();
        if len == 0 || vvecs.iter().any(|v| v.len() != len) {
            return None;
        }
        if !parallel {
            return aggregate_verification_vectors(vvecs);
        }
        self.pool.install(|| {
            (0..len)
                .into_par_iter()
                .map(|i| {
                    let column: Vec<PublicKey> = vvecs.iter().map(|v| v[i]).collect();
                    self.aggregate_public_keys(&column, true)
                })
                .collect()
        })
    }

    /// Public key share of `id` under the committed polynomial `vvec`.
    pub fn build_pub_key_share(&self, vvec: &[PublicKey], id: &BlsId) -> Option<PublicKey> {
        PublicKey::share_for(vvec, id)
    }

    /// Check each `(vvecs[i], sk_shares[i])` pair: the share must be the
    /// evaluation of the committed polynomial at `for_id`.
    pub fn verify_contribution_shares(
        &self,
        for_id: &BlsId,
        vvecs: &[VerificationVector],
        sk_shares: &[SecretKey],
        parallel: bool,
        aggregated: bool,
    ) -> Vec<bool> {
        if vvecs.len() != sk_shares.len() {
            return vec![false; vvecs.len()];
        }
        let verify_one = |vvec: &VerificationVector, share: &SecretKey| {
            PublicKey::share_for(vvec, for_id).is_some_and(|expected| expected == share.public_key())
        };
        let verify_batch = |range: std::ops::Range<usize>| -> Vec<bool> {
            let (vv, sk) = (&vvecs[range.clone()], &sk_shares[range]);
            if aggregated && vv.len() > 1 {
                let agg_vvec = aggregate_verification_vectors(vv);
                let agg_sk = SecretKey::aggregate(sk);
                if let (Some(agg_vvec), Some(agg_sk)) = (agg_vvec, agg_sk) {
                    if verify_one(&agg_vvec, &agg_sk) {
                        return vec![true; vv.len()];
                    }
                }
            }
            vv.iter().zip(sk).map(|(v, s)| verify_one(v, s)).collect()
        };

        let batch = if aggregated { CONTRIBUTION_VERIFY_BATCH_SIZE } else { 1 };
        let ranges: Vec<std::ops::Range<usize>> = (0..vvecs.len())
            .step_by(batch)
            .map(|start| start..(start + batch).min(vvecs.len()))
            .collect();
        if parallel {
            self.pool
                .install(|| ranges.into_par_iter().map(verify_batch).collect::<Vec<_>>())
                .into_iter()
                .flatten()
                .collect()
        } else {
            ranges.into_iter().flat_map(verify_batch).collect()
        }
    }

    /// Every point is a valid, non-identity group element and the vector is
    /// not empty.
    pub fn verify_verification_vector(&self, vvec: &[PublicKey]) -> bool {
        !vvec.is_empty() && vvec.iter().all(|pk| PublicKey::from_bytes(&pk.to_bytes()).is_ok())
    }

    /// All vectors valid and pairwise distinct.
    pub fn verify_verification_vectors(&self, vvecs: &[VerificationVector]) -> bool {
        let valid = self.pool.install(|| vvecs.par_iter().all(|v| self.verify_verification_vector(v)));
        if !valid {
            return false;
        }
        let mut seen = HashSet::with_capacity(vvecs.len());
        vvecs.iter().all(|v| seen.insert(verification_vector_hash(v)))
    }

    /// Fresh random polynomial with `threshold` coefficients: its
    /// verification vector and one secret share per id.
    pub fn generate_contributions(
        &self,
        threshold: usize,
        ids: &[BlsId],
    ) -> Option<(VerificationVector, Vec<SecretKey>)> {
        self.generate_contributions_with_rng(&mut rand::thread_rng(), threshold, ids)
    }

    /// [`Self::generate_contributions`] with a caller supplied RNG.
    pub fn generate_contributions_with_rng<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        threshold: usize,
        ids: &[BlsId],
    ) -> Option<(VerificationVector, Vec<SecretKey>)> {
        if threshold == 0 {
            return None;
        }
        let poly = SecretKey::random_polynomial(rng, threshold);
        let vvec: VerificationVector = poly.iter().map(SecretKey::public_key).collect();
        let shares: Option<Vec<SecretKey>> = self
            .pool
            .install(|| ids.par_iter().map(|id| SecretKey::share_for(&poly, id)).collect());
        Some((vvec, shares?))
    }

    /// Sign on the pool. Resolves to `None` if the job was lost.
    pub fn async_sign(&self, sk: SecretKey, hash: Hash256) -> impl Future<Output = Option<Signature>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(sk.sign(&hash));
        });
        async move { rx.await.ok() }
    }

    /// Sign on the pool and hand the signature to `callback`.
    pub fn async_sign_with_callback<F>(&self, sk: SecretKey, hash: Hash256, callback: F)
    where
        F: FnOnce(Signature) + Send + 'static,
    {
        self.pool.spawn(move || callback(sk.sign(&hash)));
    }

    /// Blocking [`Self::async_sign`].
    pub fn sign_sync(&self, sk: SecretKey, hash: Hash256) -> Option<Signature> {
        futures::executor::block_on(self.async_sign(sk, hash))
    }

    /// Queue a verification. `cancel` is consulted before any pairing work;
    /// a cancelled or lost request resolves to `false`.
    pub fn async_verify_sig<C>(
        &self,
        sig: Signature,
        pk: PublicKey,
        hash: Hash256,
        cancel: C,
    ) -> impl Future<Output = bool> + Send + 'static
    where
        C: Fn() -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.async_verify_sig_with_callback(sig, pk, hash, cancel, move |ok| {
            let _ = tx.send(ok);
        });
        async move { rx.await.unwrap_or(false) }
    }

    /// Queue a verification completing through `callback`.
    pub fn async_verify_sig_with_callback<C, F>(
        &self,
        sig: Signature,
        pk: PublicKey,
        hash: Hash256,
        cancel: C,
        callback: F,
    ) where
        C: Fn() -> bool + Send + Sync + 'static,
        F: FnOnce(bool) + Send + 'static,
    {
        let cancel: CancelCheck = Box::new(cancel);
        self.verify_queue
            .push(VerifyJob::new(sig, pk, hash, cancel, Box::new(callback)));
    }

    /// Blocking, uncancellable [`Self::async_verify_sig`].
    pub fn verify_sig_sync(&self, sig: Signature, pk: PublicKey, hash: Hash256) -> bool {
        futures::executor::block_on(self.async_verify_sig(sig, pk, hash, || false))
    }

    /// Dispatch queued verifications without waiting for a full batch.
    pub fn flush_verify_queue(&self) {
        self.verify_queue.flush();
    }

    /// Whether any queued or running verification has not completed.
    pub fn is_async_verify_in_progress(&self) -> bool {
        self.verify_queue.in_progress()
    }

    /// Memoized [`Self::build_quorum_verification_vector`].
    pub fn get_or_build_quorum_verification_vector(
        &self,
        key: Hash256,
        vvecs: &[VerificationVector],
        parallel: bool,
    ) -> Option<VerificationVector> {
        self.vvec_cache
            .get_or_build(key, || self.build_quorum_verification_vector(vvecs, parallel))
    }

    /// Memoized [`Self::aggregate_secret_keys`].
    pub fn get_or_aggregate_secret_keys(
        &self,
        key: Hash256,
        shares: &[SecretKey],
        parallel: bool,
    ) -> Option<SecretKey> {
        self.sk_cache
            .get_or_build(key, || self.aggregate_secret_keys(shares, parallel))
    }

    /// Memoized [`Self::build_pub_key_share`].
    pub fn get_or_build_pub_key_share(
        &self,
        key: Hash256,
        vvec: &[PublicKey],
        id: &BlsId,
    ) -> Option<PublicKey> {
        self.pk_share_cache
            .get_or_build((key, *id), || self.build_pub_key_share(vvec, id))
    }
}

impl std::fmt::Debug for CryptoWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoWorker")
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}
