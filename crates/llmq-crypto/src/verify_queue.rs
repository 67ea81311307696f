//! Batched asynchronous signature verification.
//!
//! Requests are queued and verified on the worker pool in batches. A batch
//! is dispatched right away when nothing is in flight, when the queue holds
//! [`SIG_VERIFY_BATCH_SIZE`] requests, or when a request for a message hash
//! already in the queue arrives (aggregation over equal messages is
//! unsound, so the queue is cut there). When a batch completes, anything
//! queued meanwhile goes out as the next batch.
//!
//! Inside a batch, cancelled requests resolve to `false` without pairing
//! work. Two or more live requests are first checked as one aggregate over
//! distinct messages; on failure each is verified individually.

use llmq_core::{Hash256, PublicKey, Signature};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Maximum requests per verification batch.
pub const SIG_VERIFY_BATCH_SIZE: usize = 8;

/// Cancellation predicate checked before any pairing work.
pub type CancelCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Completion callback receiving the verdict.
pub type VerifyCallback = Box<dyn FnOnce(bool) + Send>;

pub(crate) struct VerifyJob {
    sig: Signature,
    pk: PublicKey,
    hash: Hash256,
    cancel: CancelCheck,
    done: VerifyCallback,
}

impl VerifyJob {
    pub(crate) fn new(
        sig: Signature,
        pk: PublicKey,
        hash: Hash256,
        cancel: CancelCheck,
        done: VerifyCallback,
    ) -> Self {
        Self {
            sig,
            pk,
            hash,
            cancel,
            done,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queued: Vec<VerifyJob>,
    in_flight: usize,
}

pub(crate) struct VerifyQueue {
    pool: Arc<rayon::ThreadPool>,
    state: Mutex<QueueState>,
}

impl VerifyQueue {
    pub(crate) fn new(pool: Arc<rayon::ThreadPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            state: Mutex::new(QueueState::default()),
        })
    }

    pub(crate) fn push(self: &Arc<Self>, job: VerifyJob) {
        let mut state = self.state.lock();
        if state.queued.iter().any(|j| j.hash == job.hash) {
            self.dispatch_locked(&mut state);
        }
        state.queued.push(job);
        if state.in_flight == 0 || state.queued.len() >= SIG_VERIFY_BATCH_SIZE {
            self.dispatch_locked(&mut state);
        }
    }

    /// Dispatch whatever is queued now.
    pub(crate) fn flush(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.dispatch_locked(&mut state);
    }

    pub(crate) fn in_progress(&self) -> bool {
        let state = self.state.lock();
        state.in_flight > 0 || !state.queued.is_empty()
    }

    fn dispatch_locked(self: &Arc<Self>, state: &mut QueueState) {
        if state.queued.is_empty() {
            return;
        }
        let jobs = std::mem::take(&mut state.queued);
        state.in_flight += 1;
        let queue = Arc::clone(self);
        self.pool.spawn(move || {
            let _done = InFlightGuard(Arc::clone(&queue));
            verify_batch(jobs);
        });
    }
}

// Decrements the in-flight count even if verification unwinds, then
// dispatches what queued up in the meantime.
struct InFlightGuard(Arc<VerifyQueue>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.0.dispatch_locked(&mut state);
    }
}

fn verify_batch(jobs: Vec<VerifyJob>) {
    let mut live = Vec::with_capacity(jobs.len());
    for job in jobs {
        if (job.cancel)() {
            (job.done)(false);
        } else {
            live.push(job);
        }
    }

    if live.len() > 1 {
        let distinct = live.iter().map(|j| j.hash).collect::<HashSet<_>>().len() == live.len();
        if distinct {
            let sigs: Vec<Signature> = live.iter().map(|j| j.sig).collect();
            let pks: Vec<PublicKey> = live.iter().map(|j| j.pk).collect();
            let hashes: Vec<Hash256> = live.iter().map(|j| j.hash).collect();
            let batch_ok = Signature::aggregate(&sigs).is_some_and(|agg| agg.verify_aggregated(&pks, &hashes));
            if batch_ok {
                trace!(count = live.len(), "Batch signature verification succeeded");
                for job in live {
                    (job.done)(true);
                }
                return;
            }
            trace!(count = live.len(), "Batch signature verification failed, verifying individually");
        }
    }

    for job in live {
        let ok = !(job.cancel)() && job.sig.verify(&job.pk, &job.hash);
        (job.done)(ok);
    }
}
