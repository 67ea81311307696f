//! Per-quorum-type DKG phase driver.
//!
//! The handler follows the chain tip: every new block updates the current
//! phase and quorum hash, and a long-running task walks one [`DkgSession`]
//! through the phases of each interval. Network code only enqueues raw
//! payloads; the task drains them between 100 ms ticks while it waits for
//! the next phase.
//!
//! If the quorum hash observed while waiting differs from the one the round
//! started with (a reorg), the round is abandoned and nothing is emitted for
//! the orphaned quorum.

use crate::messages::{DkgComplaint, DkgContribution, DkgJustification, DkgMessage, DkgPrematureCommitment};
use crate::pending::{PendingMessages, LOCAL_PEER};
use crate::session::{batch_verify_message_sigs, DkgSession, PreVerify, SessionDeps, SessionMessage};
use llmq_core::connections::quorum_relay_members;
use llmq_core::{
    ActiveMasternode, BlockRef, ChainView, FinalCommitment, Hash256, InterruptToken, LlmqError, LlmqParams,
    MessageKind, PeerId, PeerMessenger, QuorumMembers, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Pending messages handled per drain step.
const MESSAGE_BATCH_SIZE: usize = 8;

/// Tick between phase checks.
const PHASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Misbehaviour score for malformed or badly signed DKG messages.
const MISBEHAVING_SCORE: u32 = 100;

/// Receiver of finished DKG results.
pub trait CommitmentSink: Send + Sync {
    /// Offer a verified commitment for mining. Returns its hash if it was
    /// new, in which case it is relayed.
    fn add_mineable_commitment(&self, commitment: FinalCommitment) -> Option<Hash256>;
}

/// Phases of one DKG interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QuorumPhase {
    /// Session set up with the interval's members
    Initialized = 1,
    /// Deal shares
    Contribute,
    /// Vote against bad dealers
    Complain,
    /// Answer complaints
    Justify,
    /// Sign our view of the result
    Commit,
    /// Aggregate into final commitments
    Finalize,
    /// Waiting for the next interval
    Idle,
}

impl QuorumPhase {
    /// Phase with number `index` (1-based).
    pub fn from_index(index: u32) -> Option<Self> {
        Some(match index {
            1 => Self::Initialized,
            2 => Self::Contribute,
            3 => Self::Complain,
            4 => Self::Justify,
            5 => Self::Commit,
            6 => Self::Finalize,
            7 => Self::Idle,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseState {
    phase: QuorumPhase,
    quorum: BlockRef,
    height: u32,
}

/// Collaborators of a handler.
#[derive(Clone)]
pub struct HandlerDeps {
    /// Block index
    pub chain: Arc<dyn ChainView>,
    /// Member derivation
    pub members: Arc<QuorumMembers>,
    /// Outbound network
    pub messenger: Arc<dyn PeerMessenger>,
    /// Destination of final commitments
    pub sink: Arc<dyn CommitmentSink>,
    /// Local masternode identity, if any
    pub local: Option<ActiveMasternode>,
    /// Shared session collaborators
    pub session: SessionDeps,
    /// Shutdown signal
    pub interrupt: InterruptToken,
}

type StartPhase = fn(&DkgSessionHandler);
type WhileWaiting = fn(&DkgSessionHandler) -> bool;

/// Drives DKG rounds for one quorum type.
pub struct DkgSessionHandler {
    params: LlmqParams,
    mine_on_demand: bool,
    target_spacing: Duration,
    deps: HandlerDeps,

    state: Mutex<PhaseState>,
    session: Mutex<Option<DkgSession>>,

    pending_contributions: PendingMessages,
    pending_complaints: PendingMessages,
    pending_justifications: PendingMessages,
    pending_premature_commitments: PendingMessages,
}

impl DkgSessionHandler {
    /// Handler for `params`. `target_spacing` paces the pre-phase sleep,
    /// which is skipped entirely when `mine_on_demand` is set.
    pub fn new(params: LlmqParams, mine_on_demand: bool, target_spacing: Duration, deps: HandlerDeps) -> Self {
        let max_per_node = params.size * 2;
        Self {
            params,
            mine_on_demand,
            target_spacing,
            deps,
            state: Mutex::new(PhaseState {
                phase: QuorumPhase::Idle,
                quorum: BlockRef::new(Hash256::ZERO, 0),
                height: 0,
            }),
            session: Mutex::new(None),
            pending_contributions: PendingMessages::new(max_per_node),
            pending_complaints: PendingMessages::new(max_per_node),
            pending_justifications: PendingMessages::new(max_per_node),
            pending_premature_commitments: PendingMessages::new(max_per_node),
        }
    }

    /// Parameters this handler runs.
    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    /// Current phase and quorum hash.
    pub fn phase_and_quorum_hash(&self) -> (QuorumPhase, Hash256) {
        let state = self.state.lock();
        (state.phase, state.quorum.hash)
    }

    fn current_height(&self) -> u32 {
        self.state.lock().height
    }

    /// Track a new chain tip.
    pub fn updated_block_tip(&self, tip: &BlockRef) {
        let stage = tip.height % self.params.dkg_interval;
        let Some(quorum) = self.deps.chain.ancestor(tip, tip.height - stage) else {
            warn!(llmq_type = %self.params.llmq_type, height = tip.height, "Quorum block not found for tip");
            return;
        };

        let mut state = self.state.lock();
        let old_phase = state.phase;
        state.height = tip.height;
        state.quorum = quorum;
        if stage % self.params.dkg_phase_blocks == 0 {
            if let Some(phase) = QuorumPhase::from_index(stage / self.params.dkg_phase_blocks + 1) {
                state.phase = phase;
            }
        }
        trace!(
            llmq_type = %self.params.llmq_type,
            height = tip.height,
            quorum_height = quorum.height,
            ?old_phase,
            new_phase = ?state.phase,
            "Updated DKG phase"
        );
    }

    /// Enqueue an inbound DKG payload.
    pub fn process_message(&self, peer: PeerId, kind: MessageKind, payload: &[u8]) {
        let queue = match kind {
            MessageKind::Contribution => &self.pending_contributions,
            MessageKind::Complaint => &self.pending_complaints,
            MessageKind::Justification => &self.pending_justifications,
            MessageKind::PrematureCommitment => &self.pending_premature_commitments,
            MessageKind::FinalCommitment => return,
        };
        queue.push(peer, payload.to_vec());
    }

    /// Run rounds until interrupted.
    pub async fn run(self: Arc<Self>) {
        info!(llmq_type = %self.params.llmq_type, "Starting DKG phase handler");
        while !self.deps.interrupt.is_interrupted() {
            if let Err(e) = self.handle_dkg_round().await {
                debug!(llmq_type = %self.params.llmq_type, error = %e, "Aborted current DKG session");
            }
        }
        *self.session.lock() = None;
        info!(llmq_type = %self.params.llmq_type, "DKG phase handler stopped");
    }

    fn aborted(&self, reason: &str) -> LlmqError {
        LlmqError::aborted(format!("{}: {reason}", self.params.name))
    }

    async fn wait_for_next_phase(
        &self,
        cur: Option<QuorumPhase>,
        next: QuorumPhase,
        expected: Option<Hash256>,
        while_waiting: WhileWaiting,
    ) -> Result<()> {
        trace!(?cur, ?next, "Waiting for next DKG phase");
        loop {
            if self.deps.interrupt.is_interrupted() {
                return Err(self.aborted("shutdown requested"));
            }
            let (phase, quorum_hash) = self.phase_and_quorum_hash();
            if let Some(expected) = expected {
                if quorum_hash != expected {
                    info!(
                        llmq_type = %self.params.llmq_type,
                        %expected,
                        current = %quorum_hash,
                        "Quorum hash changed, abandoning DKG round"
                    );
                    return Err(self.aborted("unexpected quorum hash change"));
                }
            }
            if phase == next {
                return Ok(());
            }
            if cur.is_some_and(|cur| cur != phase) {
                return Err(self.aborted("unexpected phase change"));
            }
            self.tick(while_waiting).await?;
        }
    }

    async fn wait_for_new_quorum(&self, old_quorum_hash: Hash256) -> Result<()> {
        loop {
            let (_, quorum_hash) = self.phase_and_quorum_hash();
            if quorum_hash != old_quorum_hash {
                return Ok(());
            }
            if !self.deps.interrupt.sleep(PHASE_POLL_INTERVAL).await {
                return Err(self.aborted("shutdown requested"));
            }
        }
    }

    /// Drain one batch, or sleep one tick when there was nothing to do.
    async fn tick(&self, while_waiting: WhileWaiting) -> Result<()> {
        if while_waiting(self) {
            tokio::task::yield_now().await;
        } else if !self.deps.interrupt.sleep(PHASE_POLL_INTERVAL).await {
            return Err(self.aborted("shutdown requested"));
        }
        Ok(())
    }

    /// Spread members over the phase so they do not all send at once.
    async fn sleep_before_phase(
        &self,
        cur: QuorumPhase,
        expected: Hash256,
        random_sleep_factor: f64,
        while_waiting: WhileWaiting,
    ) -> Result<()> {
        let my_index = match self.session.lock().as_ref().and_then(DkgSession::my_member_index) {
            Some(idx) => idx,
            // Non-members create no network load
            None => return Ok(()),
        };
        if self.mine_on_demand {
            return Ok(());
        }

        // The last block of a phase is not counted as safe sleeping time
        let phase_sleep = self
            .target_spacing
            .mul_f64(f64::from(self.params.dkg_phase_blocks.saturating_sub(1)));
        let per_member = phase_sleep.div_f64(self.params.size as f64);
        let sleep_time = per_member.mul_f64(random_sleep_factor).mul_f64(my_index as f64);
        let end = tokio::time::Instant::now() + sleep_time;
        let height_start = self.current_height();
        let mut height_seen = height_start;
        debug!(llmq_type = %self.params.llmq_type, ?cur, ?sleep_time, "Sleeping before phase");

        while tokio::time::Instant::now() < end {
            if self.deps.interrupt.is_interrupted() {
                return Err(self.aborted("shutdown requested"));
            }
            let height = self.current_height();
            if height > height_seen {
                let expected_block_time = self.target_spacing * (height - height_start);
                if expected_block_time > sleep_time {
                    // Blocks came faster than expected
                    break;
                }
                height_seen = height;
            }
            let (phase, quorum_hash) = self.phase_and_quorum_hash();
            if phase != cur || quorum_hash != expected {
                return Err(self.aborted("unexpected phase or quorum hash change"));
            }
            self.tick(while_waiting).await?;
        }
        Ok(())
    }

    async fn handle_phase(
        &self,
        cur: QuorumPhase,
        next: QuorumPhase,
        expected: Hash256,
        random_sleep_factor: f64,
        start: StartPhase,
        while_waiting: WhileWaiting,
    ) -> Result<()> {
        self.sleep_before_phase(cur, expected, random_sleep_factor, while_waiting)
            .await?;
        start(self);
        self.wait_for_next_phase(Some(cur), next, Some(expected), while_waiting)
            .await
    }

    fn init_new_quorum(&self, quorum: BlockRef) -> Result<()> {
        let members = self.deps.members.members(&self.params, &quorum);
        let session = DkgSession::new(
            self.params.clone(),
            quorum,
            &members,
            self.deps.local.as_ref(),
            self.deps.session.clone(),
        )?;
        if let Some(local) = session.my_member_index().and(self.deps.local.as_ref()) {
            let relay = quorum_relay_members(&members, &local.pro_tx_hash, false);
            self.deps
                .messenger
                .set_quorum_nodes(self.params.llmq_type, quorum.hash, relay);
        }
        info!(
            llmq_type = %self.params.llmq_type,
            quorum_hash = %quorum.hash,
            height = quorum.height,
            member = session.are_we_member(),
            "Initialized DKG session"
        );
        *self.session.lock() = Some(session);
        Ok(())
    }

    async fn handle_dkg_round(&self) -> Result<()> {
        self.wait_for_next_phase(None, QuorumPhase::Initialized, None, Self::no_drain)
            .await?;

        self.pending_contributions.clear();
        self.pending_complaints.clear();
        self.pending_justifications.clear();
        self.pending_premature_commitments.clear();
        let quorum = self.state.lock().quorum;

        if let Err(e) = self.init_new_quorum(quorum) {
            warn!(llmq_type = %self.params.llmq_type, quorum_hash = %quorum.hash, error = %e, "Quorum initialization failed");
            *self.session.lock() = None;
            self.wait_for_new_quorum(quorum.hash).await?;
            return Err(self.aborted("initialization failed"));
        }

        let hash = quorum.hash;
        self.wait_for_next_phase(
            Some(QuorumPhase::Initialized),
            QuorumPhase::Contribute,
            Some(hash),
            Self::no_drain,
        )
        .await?;
        self.handle_phase(
            QuorumPhase::Contribute,
            QuorumPhase::Complain,
            hash,
            0.05,
            Self::start_contribute,
            Self::drain_contributions,
        )
        .await?;
        self.handle_phase(
            QuorumPhase::Complain,
            QuorumPhase::Justify,
            hash,
            0.05,
            Self::start_complain,
            Self::drain_complaints,
        )
        .await?;
        self.handle_phase(
            QuorumPhase::Justify,
            QuorumPhase::Commit,
            hash,
            0.05,
            Self::start_justify,
            Self::drain_justifications,
        )
        .await?;
        self.handle_phase(
            QuorumPhase::Commit,
            QuorumPhase::Finalize,
            hash,
            0.1,
            Self::start_commit,
            Self::drain_premature_commitments,
        )
        .await?;

        let commitments = self
            .session
            .lock()
            .as_ref()
            .map(DkgSession::finalize_commitments)
            .unwrap_or_default();
        for commitment in commitments {
            let payload = commitment.encode();
            if self.deps.sink.add_mineable_commitment(commitment).is_some() {
                self.deps.messenger.relay(MessageKind::FinalCommitment, payload);
            }
        }
        Ok(())
    }

    // Start actions

    fn publish<M: DkgMessage>(&self, queue: &PendingMessages, msg: &M) {
        match msg.encode() {
            Ok(payload) => {
                self.deps.messenger.relay(M::KIND, payload.clone());
                // Our own message goes through the same path as everyone else's
                queue.push(LOCAL_PEER, payload);
            }
            Err(e) => warn!(kind = M::KIND.command(), error = %e, "Failed to encode DKG message"),
        }
    }

    fn start_contribute(&self) {
        let msg = self
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.contribute(&mut rand::thread_rng()));
        if let Some(msg) = msg {
            self.publish(&self.pending_contributions, &msg);
        }
    }

    fn start_complain(&self) {
        let msg = self
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.verify_and_complain(&mut rand::thread_rng()));
        if let Some(msg) = msg {
            self.publish(&self.pending_complaints, &msg);
        }
    }

    fn start_justify(&self) {
        let msg = self
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.verify_and_justify(&mut rand::thread_rng()));
        if let Some(msg) = msg {
            self.publish(&self.pending_justifications, &msg);
        }
    }

    fn start_commit(&self) {
        let msg = self
            .session
            .lock()
            .as_mut()
            .and_then(DkgSession::verify_and_commit);
        if let Some(msg) = msg {
            self.publish(&self.pending_premature_commitments, &msg);
        }
    }

    // Pending message draining

    fn no_drain(&self) -> bool {
        false
    }

    fn drain_contributions(&self) -> bool {
        self.process_pending_batch::<DkgContribution>(&self.pending_contributions)
    }

    fn drain_complaints(&self) -> bool {
        self.process_pending_batch::<DkgComplaint>(&self.pending_complaints)
    }

    fn drain_justifications(&self) -> bool {
        self.process_pending_batch::<DkgJustification>(&self.pending_justifications)
    }

    fn drain_premature_commitments(&self) -> bool {
        self.process_pending_batch::<DkgPrematureCommitment>(&self.pending_premature_commitments)
    }

    fn report(&self, peer: PeerId, reason: &str) {
        debug!(%peer, reason, "Bad DKG message");
        if peer != LOCAL_PEER {
            self.deps
                .messenger
                .misbehaving(peer, MISBEHAVING_SCORE, reason);
        }
    }

    /// Returns whether anything was popped.
    fn process_pending_batch<M: SessionMessage>(&self, queue: &PendingMessages) -> bool {
        let msgs = queue.pop_and_decode::<M>(MESSAGE_BATCH_SIZE);
        if msgs.is_empty() {
            return false;
        }
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return true;
        };

        let mut preverified = Vec::with_capacity(msgs.len());
        for (peer, hash, decoded) in msgs {
            let msg = match decoded {
                Ok(msg) => msg,
                Err(_) => {
                    self.report(peer, "failed to deserialize message");
                    continue;
                }
            };
            match M::pre_verify(session, &msg) {
                PreVerify::Accept => preverified.push((peer, hash, msg)),
                PreVerify::Ban => self.report(peer, "failed preverification"),
                PreVerify::Ignore => trace!(%peer, "Skipping DKG message"),
            }
        }
        if preverified.is_empty() {
            return true;
        }

        let bad_peers = batch_verify_message_sigs(session, &preverified);
        for peer in &bad_peers {
            self.report(*peer, "failed to verify signature");
        }
        for (peer, hash, msg) in preverified {
            if !bad_peers.contains(&peer) {
                M::receive(session, hash, msg);
            }
        }
        true
    }
}

impl std::fmt::Debug for DkgSessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkgSessionHandler")
            .field("llmq_type", &self.params.llmq_type)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_indexes() {
        assert_eq!(QuorumPhase::from_index(1), Some(QuorumPhase::Initialized));
        assert_eq!(QuorumPhase::from_index(6), Some(QuorumPhase::Finalize));
        assert_eq!(QuorumPhase::from_index(7), Some(QuorumPhase::Idle));
        assert_eq!(QuorumPhase::from_index(0), None);
        assert_eq!(QuorumPhase::from_index(8), None);
        assert!(QuorumPhase::Contribute < QuorumPhase::Commit);
    }
}
