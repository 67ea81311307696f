//! State of one DKG round.
//!
//! A session lives from `Initialized` to `Finalize` of a single quorum
//! interval. It is driven synchronously by the phase handler: start actions
//! produce the local member's messages, `pre_verify_*` does cheap checks on
//! inbound messages before their signatures are batch-verified, and
//! `receive_*` folds verified messages into the session state.
//!
//! Non-members run sessions too. They cannot contribute, but they still
//! track contributions and complaints so they can finalize commitments.

use crate::contributions::ContributionStore;
use crate::encryption::{decrypt_share, encrypt_share};
use crate::messages::{
    DkgComplaint, DkgContribution, DkgJustification, DkgMessage, DkgPrematureCommitment, MessageHeader,
};
use crate::simulation::{SimulatedErrorKind, SimulatedErrors};
use llmq_core::bls::verification_vector_hash;
use llmq_core::{
    build_commitment_hash, ActiveMasternode, BitSet, BlockRef, BlsId, FinalCommitment, Hash256, HashWriter,
    LlmqError, LlmqParams, LlmqType, Masternode, PeerId, PublicKey, Result, SecretKey, Signature, VerificationVector,
    COMMITMENT_VERSION,
};
use llmq_crypto::CryptoWorker;
use rand::{CryptoRng, Rng, RngCore};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of the cheap checks done before signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreVerify {
    /// Worth verifying and receiving
    Accept,
    /// Drop without penalty (stale, duplicate)
    Ignore,
    /// Malformed; the sender misbehaved
    Ban,
}

/// Shared collaborators of every session.
#[derive(Debug, Clone)]
pub struct SessionDeps {
    /// Crypto offload
    pub worker: Arc<CryptoWorker>,
    /// Where verified contributions are persisted on commit
    pub contributions: Arc<ContributionStore>,
    /// Fault injection rates
    pub simulated_errors: Arc<SimulatedErrors>,
}

#[derive(Debug)]
struct DkgMember {
    mn: Masternode,
    id: BlsId,

    contributions: HashSet<Hash256>,
    complaints: HashSet<Hash256>,
    justifications: HashSet<Hash256>,
    premature_commitments: HashSet<Hash256>,

    bad_member_votes: BTreeSet<usize>,
    complaints_from_others: BTreeSet<usize>,
    justified_for: BTreeSet<usize>,

    bad: bool,
    we_complain: bool,
}

impl DkgMember {
    fn new(mn: Masternode) -> Self {
        let id = BlsId::from_hash(&mn.pro_tx_hash);
        Self {
            mn,
            id,
            contributions: HashSet::new(),
            complaints: HashSet::new(),
            justifications: HashSet::new(),
            premature_commitments: HashSet::new(),
            bad_member_votes: BTreeSet::new(),
            complaints_from_others: BTreeSet::new(),
            justified_for: BTreeSet::new(),
            bad: false,
            we_complain: false,
        }
    }
}

/// One DKG round for one quorum.
#[derive(Debug)]
pub struct DkgSession {
    params: LlmqParams,
    quorum: BlockRef,
    members: Vec<DkgMember>,
    member_ids: Vec<BlsId>,
    by_pro_tx: HashMap<Hash256, usize>,
    me: Option<(usize, SecretKey)>,
    deps: SessionDeps,

    // Our dealing
    sk_contributions: Vec<SecretKey>,

    // What others dealt to us, by member index
    received_vvecs: Vec<Option<VerificationVector>>,
    received_sk_contributions: Vec<Option<SecretKey>>,
    pending_contribution_verifications: Vec<usize>,

    contributions: HashMap<Hash256, DkgContribution>,
    complaints: HashMap<Hash256, DkgComplaint>,
    justifications: HashMap<Hash256, DkgJustification>,
    premature_commitments: HashMap<Hash256, DkgPrematureCommitment>,
    valid_commitments: HashSet<Hash256>,

    quorum_sk_share: Option<SecretKey>,
}

impl DkgSession {
    /// Set up a session for `quorum` with its deterministic member list.
    ///
    /// `local` becomes the participating member when its registration hash is
    /// in `members` and its operator key matches the listed one.
    pub fn new(
        params: LlmqParams,
        quorum: BlockRef,
        members: &[Masternode],
        local: Option<&ActiveMasternode>,
        deps: SessionDeps,
    ) -> Result<Self> {
        if members.len() < params.min_size {
            return Err(LlmqError::invalid(format!(
                "not enough members for {}: {} < {}",
                params.name,
                members.len(),
                params.min_size
            )));
        }
        let members: Vec<DkgMember> = members.iter().cloned().map(DkgMember::new).collect();
        let member_ids = members.iter().map(|m| m.id).collect();
        let by_pro_tx: HashMap<Hash256, usize> = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.mn.pro_tx_hash, i))
            .collect();

        let me = local.and_then(|local| {
            let idx = *by_pro_tx.get(&local.pro_tx_hash)?;
            if members[idx].mn.operator_key != local.operator_key.public_key() {
                warn!(
                    quorum_hash = %quorum.hash,
                    pro_tx_hash = %local.pro_tx_hash,
                    "Operator key does not match the masternode list, not participating"
                );
                return None;
            }
            Some((idx, local.operator_key.clone()))
        });

        let n = members.len();
        Ok(Self {
            params,
            quorum,
            members,
            member_ids,
            by_pro_tx,
            me,
            deps,
            sk_contributions: Vec::new(),
            received_vvecs: vec![None; n],
            received_sk_contributions: vec![None; n],
            pending_contribution_verifications: Vec::new(),
            contributions: HashMap::new(),
            complaints: HashMap::new(),
            justifications: HashMap::new(),
            premature_commitments: HashMap::new(),
            valid_commitments: HashSet::new(),
            quorum_sk_share: None,
        })
    }

    /// Quorum block of this round.
    pub fn quorum(&self) -> &BlockRef {
        &self.quorum
    }

    /// Parameters of this round.
    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    /// Members in quorum order.
    pub fn members(&self) -> Vec<Masternode> {
        self.members.iter().map(|m| m.mn.clone()).collect()
    }

    /// Whether the local node participates.
    pub fn are_we_member(&self) -> bool {
        self.me.is_some()
    }

    /// Local member index, when participating.
    pub fn my_member_index(&self) -> Option<usize> {
        self.me.as_ref().map(|(idx, _)| *idx)
    }

    /// Index of `pro_tx_hash` in the member list.
    pub fn member_index(&self, pro_tx_hash: &Hash256) -> Option<usize> {
        self.by_pro_tx.get(pro_tx_hash).copied()
    }

    /// Operator key of the member that sent `header`.
    pub fn sender_operator_key(&self, header: &MessageHeader) -> Option<PublicKey> {
        self.member_index(&header.pro_tx_hash)
            .map(|i| self.members[i].mn.operator_key)
    }

    /// Whether member `idx` is considered bad.
    pub fn is_bad_member(&self, idx: usize) -> bool {
        self.members.get(idx).is_some_and(|m| m.bad)
    }

    /// Our quorum secret key share, once committed.
    pub fn quorum_sk_share(&self) -> Option<&SecretKey> {
        self.quorum_sk_share.as_ref()
    }

    fn header(&self) -> Option<MessageHeader> {
        let (idx, _) = self.me.as_ref()?;
        Some(MessageHeader {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum.hash,
            pro_tx_hash: self.members[*idx].mn.pro_tx_hash,
        })
    }

    fn should_simulate(&self, kind: SimulatedErrorKind) -> bool {
        let hit = self.deps.simulated_errors.should_simulate(kind);
        if hit {
            warn!(quorum_hash = %self.quorum.hash, %kind, "Simulating DKG error");
        }
        hit
    }

    fn mark_bad(&mut self, idx: usize, reason: &str) {
        let member = &mut self.members[idx];
        if member.bad {
            return;
        }
        member.bad = true;
        info!(
            quorum_hash = %self.quorum.hash,
            pro_tx_hash = %member.mn.pro_tx_hash,
            reason,
            "Marked member as bad"
        );
    }

    /// Common header checks. Returns the sender's member index on success.
    fn pre_verify_header(&self, header: &MessageHeader) -> std::result::Result<usize, PreVerify> {
        if header.llmq_type != self.params.llmq_type {
            debug!(llmq_type = %header.llmq_type, "DKG message for another quorum type");
            return Err(PreVerify::Ban);
        }
        if header.quorum_hash != self.quorum.hash {
            debug!(quorum_hash = %header.quorum_hash, "DKG message for another quorum");
            return Err(PreVerify::Ignore);
        }
        self.member_index(&header.pro_tx_hash).ok_or_else(|| {
            debug!(pro_tx_hash = %header.pro_tx_hash, "DKG message from non-member");
            PreVerify::Ban
        })
    }

    fn has_bits_beyond_members(&self, bits: &BitSet) -> bool {
        bits.len() != self.params.size || bits.any_from(self.members.len())
    }

    // Contribute

    /// Deal a random polynomial to all members.
    pub fn contribute<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Option<DkgContribution> {
        let header = self.header()?;
        let (my_idx, operator_key) = self.me.clone()?;
        let (vvec, shares) =
            self.deps
                .worker
                .generate_contributions_with_rng(rng, self.params.threshold, &self.member_ids)?;

        // A lie only corrupts what one other member receives; our record stays honest
        let liar_victim = if shares.len() > 1 && self.should_simulate(SimulatedErrorKind::ContributionLie) {
            let v = rng.gen_range(0..shares.len() - 1);
            Some(if v >= my_idx { v + 1 } else { v })
        } else {
            None
        };

        let mut encrypted = Vec::with_capacity(shares.len());
        for (i, (member, share)) in self.members.iter().zip(&shares).enumerate() {
            let lie;
            let share = if liar_victim == Some(i) {
                lie = SecretKey::random(rng);
                &lie
            } else {
                share
            };
            let Some(blob) = encrypt_share(rng, &operator_key, &member.mn.operator_key, share) else {
                error!(pro_tx_hash = %member.mn.pro_tx_hash, "Failed to encrypt contribution");
                return None;
            };
            encrypted.push(blob);
        }

        self.sk_contributions = shares;

        if self.should_simulate(SimulatedErrorKind::ContributionOmit) {
            return None;
        }
        debug!(quorum_hash = %self.quorum.hash, "Sending contribution");
        Some(DkgContribution::signed(header, vvec, encrypted, &operator_key))
    }

    /// Cheap checks on an inbound contribution.
    pub fn pre_verify_contribution(&self, msg: &DkgContribution) -> PreVerify {
        let idx = match self.pre_verify_header(&msg.header) {
            Ok(idx) => idx,
            Err(verdict) => return verdict,
        };
        if msg.vvec.len() != self.params.threshold {
            debug!(len = msg.vvec.len(), "Contribution with wrong vvec size");
            return PreVerify::Ban;
        }
        if msg.encrypted_shares.len() != self.members.len() {
            debug!(len = msg.encrypted_shares.len(), "Contribution with wrong share count");
            return PreVerify::Ban;
        }
        if !self.members[idx].contributions.is_empty() {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Duplicate contribution");
            return PreVerify::Ignore;
        }
        if !self.deps.worker.verify_verification_vector(&msg.vvec) {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Contribution with invalid vvec");
            return PreVerify::Ban;
        }
        PreVerify::Accept
    }

    /// Record a verified contribution and decrypt our share.
    pub fn receive_contribution(&mut self, hash: Hash256, msg: DkgContribution) {
        let Some(idx) = self.member_index(&msg.header.pro_tx_hash) else {
            return;
        };
        if !self.members[idx].contributions.is_empty() {
            return;
        }
        self.members[idx].contributions.insert(hash);
        self.received_vvecs[idx] = Some(msg.vvec.clone());

        if let Some((my_idx, operator_key)) = &self.me {
            let sender_key = self.members[idx].mn.operator_key;
            match decrypt_share(operator_key, &sender_key, &msg.encrypted_shares[*my_idx]) {
                Some(share) => {
                    self.received_sk_contributions[idx] = Some(share);
                    self.pending_contribution_verifications.push(idx);
                }
                None => {
                    debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Failed to decrypt contribution share");
                    self.members[idx].we_complain = true;
                }
            }
        }
        self.contributions.insert(hash, msg);
    }

    /// Verify decrypted shares not yet checked, complaining about bad ones.
    pub fn verify_pending_contributions(&mut self) {
        let Some((my_idx, _)) = &self.me else {
            self.pending_contribution_verifications.clear();
            return;
        };
        let my_id = self.member_ids[*my_idx];
        let pending: Vec<usize> = std::mem::take(&mut self.pending_contribution_verifications)
            .into_iter()
            .filter(|i| self.received_vvecs[*i].is_some() && self.received_sk_contributions[*i].is_some())
            .collect();
        if pending.is_empty() {
            return;
        }

        let vvecs: Vec<VerificationVector> = pending
            .iter()
            .filter_map(|i| self.received_vvecs[*i].clone())
            .collect();
        let shares: Vec<SecretKey> = pending
            .iter()
            .filter_map(|i| self.received_sk_contributions[*i].clone())
            .collect();
        let results = self
            .deps
            .worker
            .verify_contribution_shares(&my_id, &vvecs, &shares, true, true);

        for (idx, ok) in pending.into_iter().zip(results) {
            if !ok {
                debug!(
                    pro_tx_hash = %self.members[idx].mn.pro_tx_hash,
                    "Contribution share failed verification"
                );
                self.members[idx].we_complain = true;
                self.received_sk_contributions[idx] = None;
            }
        }
    }

    // Complain

    /// Vote against silent members and complain about bad shares.
    pub fn verify_and_complain<R: RngCore>(&mut self, rng: &mut R) -> Option<DkgComplaint> {
        self.verify_pending_contributions();

        for idx in 0..self.members.len() {
            if self.members[idx].contributions.is_empty() {
                self.mark_bad(idx, "no contribution");
            }
        }

        let header = self.header()?;
        if self.should_simulate(SimulatedErrorKind::ComplainLie) {
            let my_idx = self.my_member_index()?;
            let victim = rng.gen_range(0..self.members.len());
            if victim != my_idx {
                self.members[victim].we_complain = true;
            }
        }

        let bad = BitSet::from_indexes(
            self.params.size,
            self.members.iter().enumerate().filter(|(_, m)| m.bad).map(|(i, _)| i),
        );
        let complain = BitSet::from_indexes(
            self.params.size,
            self.members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.we_complain)
                .map(|(i, _)| i),
        );
        if bad.none() && complain.none() {
            debug!(quorum_hash = %self.quorum.hash, "No complaints to send");
            return None;
        }

        let (_, operator_key) = self.me.as_ref()?;
        debug!(
            quorum_hash = %self.quorum.hash,
            bad = bad.count_ones(),
            complaints = complain.count_ones(),
            "Sending complaint"
        );
        Some(DkgComplaint::signed(header, bad, complain, operator_key))
    }

    /// Cheap checks on an inbound complaint.
    pub fn pre_verify_complaint(&self, msg: &DkgComplaint) -> PreVerify {
        let idx = match self.pre_verify_header(&msg.header) {
            Ok(idx) => idx,
            Err(verdict) => return verdict,
        };
        if self.has_bits_beyond_members(&msg.bad_members) || self.has_bits_beyond_members(&msg.complain_for_members)
        {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Complaint with invalid bitset");
            return PreVerify::Ban;
        }
        if !self.members[idx].complaints.is_empty() {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Duplicate complaint");
            return PreVerify::Ignore;
        }
        PreVerify::Accept
    }

    /// Count votes and complaints.
    pub fn receive_complaint(&mut self, hash: Hash256, msg: DkgComplaint) {
        let Some(idx) = self.member_index(&msg.header.pro_tx_hash) else {
            return;
        };
        if !self.members[idx].complaints.is_empty() {
            return;
        }
        self.members[idx].complaints.insert(hash);

        let n = self.members.len();
        for target in msg.bad_members.iter_ones().filter(|&t| t < n) {
            self.members[target].bad_member_votes.insert(idx);
            if self.members[target].bad_member_votes.len() >= self.params.dkg_bad_votes_threshold {
                self.mark_bad(target, "too many bad member votes");
            }
        }
        for target in msg.complain_for_members.iter_ones().filter(|&t| t < n) {
            self.members[target].complaints_from_others.insert(idx);
        }
        self.complaints.insert(hash, msg);
    }

    // Justify

    /// Reveal the shares we dealt to everyone who complained about us.
    pub fn verify_and_justify<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Option<DkgJustification> {
        for idx in 0..self.members.len() {
            if self.members[idx].complaints_from_others.len() >= self.params.dkg_bad_votes_threshold {
                self.mark_bad(idx, "too many complaints");
            }
        }

        let header = self.header()?;
        let (my_idx, operator_key) = self.me.clone()?;
        let me = &self.members[my_idx];
        if me.bad || me.complaints_from_others.is_empty() || self.sk_contributions.is_empty() {
            return None;
        }
        if self.should_simulate(SimulatedErrorKind::JustifyOmit) {
            return None;
        }

        let mut revealed: Vec<(u32, SecretKey)> = me
            .complaints_from_others
            .iter()
            .filter_map(|&i| Some((u32::try_from(i).ok()?, self.sk_contributions.get(i)?.clone())))
            .collect();
        if !revealed.is_empty() && self.should_simulate(SimulatedErrorKind::JustifyLie) {
            let victim = rng.gen_range(0..revealed.len());
            revealed[victim].1 = SecretKey::random(rng);
        }

        debug!(quorum_hash = %self.quorum.hash, count = revealed.len(), "Sending justification");
        Some(DkgJustification::signed(header, revealed, &operator_key))
    }

    /// Cheap checks on an inbound justification.
    pub fn pre_verify_justification(&self, msg: &DkgJustification) -> PreVerify {
        let idx = match self.pre_verify_header(&msg.header) {
            Ok(idx) => idx,
            Err(verdict) => return verdict,
        };
        if !self.members[idx].justifications.is_empty() {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Duplicate justification");
            return PreVerify::Ignore;
        }
        if self.members[idx].contributions.is_empty() {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Justification without contribution");
            return PreVerify::Ignore;
        }
        let mut seen = HashSet::new();
        for (target, _) in &msg.contributions {
            let target = *target as usize;
            if target >= self.members.len() || !seen.insert(target) {
                debug!(pro_tx_hash = %msg.header.pro_tx_hash, target, "Justification with invalid index");
                return PreVerify::Ban;
            }
        }
        PreVerify::Accept
    }

    /// Check revealed shares against the dealer's vvec.
    pub fn receive_justification(&mut self, hash: Hash256, msg: DkgJustification) {
        let Some(idx) = self.member_index(&msg.header.pro_tx_hash) else {
            return;
        };
        if !self.members[idx].justifications.is_empty() {
            return;
        }
        self.members[idx].justifications.insert(hash);

        let Some(vvec) = self.received_vvecs[idx].clone() else {
            self.justifications.insert(hash, msg);
            return;
        };
        let my_idx = self.my_member_index();
        for (target, share) in &msg.contributions {
            let target = *target as usize;
            let expected = self
                .deps
                .worker
                .build_pub_key_share(&vvec, &self.member_ids[target]);
            if expected != Some(share.public_key()) {
                self.mark_bad(idx, "invalid justification");
                break;
            }
            self.members[idx].justified_for.insert(target);
            if my_idx == Some(target) {
                self.received_sk_contributions[idx] = Some(share.clone());
                self.members[idx].we_complain = false;
            }
        }
        self.justifications.insert(hash, msg);
    }

    // Commit

    /// Build our view of the quorum and sign it.
    pub fn verify_and_commit(&mut self) -> Option<DkgPrematureCommitment> {
        self.verify_pending_contributions();

        for idx in 0..self.members.len() {
            let member = &self.members[idx];
            if !member.complaints_from_others.is_subset(&member.justified_for) {
                self.mark_bad(idx, "unanswered complaints");
            } else if member.we_complain && self.received_sk_contributions[idx].is_none() {
                self.mark_bad(idx, "no valid share for us");
            }
        }

        let header = self.header()?;
        let (_, operator_key) = self.me.clone()?;

        let valid: Vec<usize> = (0..self.members.len())
            .filter(|&i| {
                !self.members[i].bad
                    && self.received_vvecs[i].is_some()
                    && self.received_sk_contributions[i].is_some()
            })
            .collect();
        if valid.len() < self.params.min_size {
            warn!(
                quorum_hash = %self.quorum.hash,
                valid = valid.len(),
                min_size = self.params.min_size,
                "Not enough valid members to commit"
            );
            return None;
        }

        let vvecs: Vec<VerificationVector> = valid.iter().filter_map(|&i| self.received_vvecs[i].clone()).collect();
        let shares: Vec<SecretKey> = valid
            .iter()
            .filter_map(|&i| self.received_sk_contributions[i].clone())
            .collect();
        let worker = &self.deps.worker;
        let Some(quorum_vvec) = worker.build_quorum_verification_vector(&vvecs, true) else {
            error!(quorum_hash = %self.quorum.hash, "Failed to build quorum verification vector");
            return None;
        };
        let Some(sk_share) = worker.aggregate_secret_keys(&shares, true) else {
            error!(quorum_hash = %self.quorum.hash, "Failed to aggregate secret key share");
            return None;
        };

        for ((&i, vvec), share) in valid.iter().zip(vvecs).zip(shares) {
            let pro_tx_hash = self.members[i].mn.pro_tx_hash;
            let store = &self.deps.contributions;
            store.write_verified_vvec_contribution(self.params.llmq_type, self.quorum.hash, pro_tx_hash, vvec);
            store.write_verified_sk_contribution(self.params.llmq_type, self.quorum.hash, pro_tx_hash, share);
        }
        if let Err(e) = self.deps.contributions.flush() {
            error!(quorum_hash = %self.quorum.hash, error = %e, "Failed to persist verified contributions");
        }

        let valid_members = BitSet::from_indexes(self.params.size, valid);
        let quorum_public_key = *quorum_vvec.first()?;
        let quorum_vvec_hash = verification_vector_hash(&quorum_vvec);
        let commitment_hash =
            build_commitment_hash(&self.quorum.hash, &valid_members, &quorum_public_key, &quorum_vvec_hash);
        let quorum_sig = sk_share.sign(&commitment_hash);
        self.quorum_sk_share = Some(sk_share);

        if self.should_simulate(SimulatedErrorKind::CommitOmit) {
            return None;
        }

        debug!(
            quorum_hash = %self.quorum.hash,
            valid = valid_members.count_ones(),
            commitment_hash = %commitment_hash,
            "Sending premature commitment"
        );
        Some(DkgPrematureCommitment {
            header,
            valid_members,
            quorum_public_key,
            quorum_vvec_hash,
            quorum_sig,
            sig: operator_key.sign(&commitment_hash),
        })
    }

    /// Cheap checks on an inbound premature commitment.
    pub fn pre_verify_premature_commitment(&self, msg: &DkgPrematureCommitment) -> PreVerify {
        let idx = match self.pre_verify_header(&msg.header) {
            Ok(idx) => idx,
            Err(verdict) => return verdict,
        };
        if self.has_bits_beyond_members(&msg.valid_members) {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment with invalid bitset");
            return PreVerify::Ban;
        }
        if msg.valid_members.count_ones() < self.params.min_size {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment with too few valid members");
            return PreVerify::Ban;
        }
        if !msg.valid_members.get(idx) {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment from member it lists as invalid");
            return PreVerify::Ban;
        }
        if !self.members[idx].premature_commitments.is_empty() {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Duplicate premature commitment");
            return PreVerify::Ignore;
        }
        PreVerify::Accept
    }

    /// Check a premature commitment against our own view of the dealers.
    pub fn receive_premature_commitment(&mut self, hash: Hash256, msg: DkgPrematureCommitment) {
        let Some(idx) = self.member_index(&msg.header.pro_tx_hash) else {
            return;
        };
        if !self.members[idx].premature_commitments.is_empty() {
            return;
        }
        self.members[idx].premature_commitments.insert(hash);

        if self.check_premature_commitment(idx, &msg) {
            self.valid_commitments.insert(hash);
        }
        self.premature_commitments.insert(hash, msg);
    }

    fn check_premature_commitment(&self, idx: usize, msg: &DkgPrematureCommitment) -> bool {
        let vvecs: Option<Vec<VerificationVector>> = msg
            .valid_members
            .iter_ones()
            .map(|i| self.received_vvecs[i].clone())
            .collect();
        let Some(vvecs) = vvecs else {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment lists a member we have no vvec for");
            return false;
        };

        let worker = &self.deps.worker;
        let key = valid_set_key(self.params.llmq_type, &self.quorum.hash, &msg.valid_members);
        let Some(quorum_vvec) = worker.get_or_build_quorum_verification_vector(key, &vvecs, true) else {
            return false;
        };
        if quorum_vvec.first() != Some(&msg.quorum_public_key) {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment with wrong quorum public key");
            return false;
        }
        let vvec_hash = verification_vector_hash(&quorum_vvec);
        if vvec_hash != msg.quorum_vvec_hash {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment with wrong vvec hash");
            return false;
        }
        let Some(pk_share) = worker.get_or_build_pub_key_share(vvec_hash, &quorum_vvec, &self.member_ids[idx]) else {
            return false;
        };
        if !msg.quorum_sig.verify(&pk_share, &msg.commitment_hash()) {
            debug!(pro_tx_hash = %msg.header.pro_tx_hash, "Premature commitment with invalid quorum signature share");
            return false;
        }
        true
    }

    // Finalize

    /// Aggregate matching premature commitments into final commitments.
    pub fn finalize_commitments(&self) -> Vec<FinalCommitment> {
        let mut groups: BTreeMap<Hash256, Vec<(usize, &DkgPrematureCommitment)>> = BTreeMap::new();
        for hash in &self.valid_commitments {
            let Some(msg) = self.premature_commitments.get(hash) else {
                continue;
            };
            let Some(idx) = self.member_index(&msg.header.pro_tx_hash) else {
                continue;
            };
            groups.entry(msg.commitment_hash()).or_default().push((idx, msg));
        }

        let mems = self.members();
        let mut result = Vec::new();
        for (commitment_hash, mut group) in groups {
            if group.len() < self.params.min_size {
                debug!(
                    quorum_hash = %self.quorum.hash,
                    %commitment_hash,
                    signers = group.len(),
                    "Not enough signers for commitment"
                );
                continue;
            }
            group.sort_by_key(|(idx, _)| *idx);
            let first = group[0].1;

            let operator_keys: Vec<PublicKey> = group.iter().map(|(idx, _)| mems[*idx].operator_key).collect();
            let operator_sigs: Vec<Signature> = group.iter().map(|(_, m)| m.sig).collect();
            let Some(members_sig) = Signature::aggregate_secure(&operator_keys, &operator_sigs) else {
                error!(quorum_hash = %self.quorum.hash, %commitment_hash, "Failed to aggregate members signature");
                continue;
            };
            let shares: Vec<(BlsId, Signature)> = group
                .iter()
                .take(self.params.threshold)
                .map(|(idx, m)| (self.member_ids[*idx], m.quorum_sig))
                .collect();
            let Some(quorum_sig) = Signature::recover(&shares) else {
                error!(quorum_hash = %self.quorum.hash, %commitment_hash, "Failed to recover quorum signature");
                continue;
            };

            let fc = FinalCommitment {
                version: COMMITMENT_VERSION,
                quorum_hash: self.quorum.hash,
                signers: BitSet::from_indexes(self.params.size, group.iter().map(|(idx, _)| *idx)),
                valid_members: first.valid_members.clone(),
                quorum_public_key: Some(first.quorum_public_key),
                quorum_vvec_hash: first.quorum_vvec_hash,
                quorum_sig: Some(quorum_sig),
                members_sig: Some(members_sig),
            };
            if !fc.verify(&self.quorum, &mems, &self.params, true) {
                error!(quorum_hash = %self.quorum.hash, %commitment_hash, "Final commitment failed verification");
                continue;
            }
            info!(
                quorum_hash = %self.quorum.hash,
                signers = fc.count_signers(),
                valid = fc.count_valid_members(),
                "Final commitment ready"
            );
            result.push(fc);
        }
        result
    }
}

/// Memoization key of everything derived from one valid-member set of a
/// quorum (aggregate vvec, key shares).
pub fn valid_set_key(llmq_type: LlmqType, quorum_hash: &Hash256, valid_members: &BitSet) -> Hash256 {
    let mut bits = Vec::new();
    valid_members.encode_dyn(&mut bits);
    let mut w = HashWriter::new();
    w.write_u8(llmq_type.0).write_hash(quorum_hash).write(&bits);
    w.finish()
}

/// Senders whose signatures failed in a batch of decoded messages.
///
/// All signatures are aggregated and checked at once. If that fails and every
/// message came from one peer, only that peer is blamed; otherwise each
/// message is checked on its own.
pub fn batch_verify_message_sigs<M: DkgMessage>(
    session: &DkgSession,
    messages: &[(PeerId, Hash256, M)],
) -> HashSet<PeerId> {
    let mut bad = HashSet::new();
    let mut sigs = Vec::with_capacity(messages.len());
    let mut keys = Vec::with_capacity(messages.len());
    let mut hashes = Vec::with_capacity(messages.len());
    let mut distinct = HashSet::new();
    let mut revert_to_single = false;

    for (peer, _, msg) in messages {
        let Some(pk) = session.sender_operator_key(msg.header()) else {
            bad.insert(*peer);
            continue;
        };
        let sign_hash = msg.sign_hash();
        if !distinct.insert(sign_hash) {
            revert_to_single = true;
        }
        sigs.push(*msg.sig());
        keys.push(pk);
        hashes.push(sign_hash);
    }
    if sigs.is_empty() {
        return bad;
    }

    if !revert_to_single {
        if let Some(agg) = Signature::aggregate(&sigs) {
            if agg.verify_aggregated(&keys, &hashes) {
                return bad;
            }
        }
        let first = messages[0].0;
        if messages.iter().all(|(peer, _, _)| *peer == first) {
            bad.insert(first);
            return bad;
        }
    }

    for (peer, _, msg) in messages {
        let Some(pk) = session.sender_operator_key(msg.header()) else {
            continue;
        };
        if !msg.sig().verify(&pk, &msg.sign_hash()) {
            bad.insert(*peer);
        }
    }
    bad
}

/// Dispatch of per-kind session entry points.
pub(crate) trait SessionMessage: DkgMessage {
    fn pre_verify(session: &DkgSession, msg: &Self) -> PreVerify;
    fn receive(session: &mut DkgSession, hash: Hash256, msg: Self);
}

impl SessionMessage for DkgContribution {
    fn pre_verify(session: &DkgSession, msg: &Self) -> PreVerify {
        session.pre_verify_contribution(msg)
    }

    fn receive(session: &mut DkgSession, hash: Hash256, msg: Self) {
        session.receive_contribution(hash, msg);
    }
}

impl SessionMessage for DkgComplaint {
    fn pre_verify(session: &DkgSession, msg: &Self) -> PreVerify {
        session.pre_verify_complaint(msg)
    }

    fn receive(session: &mut DkgSession, hash: Hash256, msg: Self) {
        session.receive_complaint(hash, msg);
    }
}

impl SessionMessage for DkgJustification {
    fn pre_verify(session: &DkgSession, msg: &Self) -> PreVerify {
        session.pre_verify_justification(msg)
    }

    fn receive(session: &mut DkgSession, hash: Hash256, msg: Self) {
        session.receive_justification(hash, msg);
    }
}

impl SessionMessage for DkgPrematureCommitment {
    fn pre_verify(session: &DkgSession, msg: &Self) -> PreVerify {
        session.pre_verify_premature_commitment(msg)
    }

    fn receive(session: &mut DkgSession, hash: Hash256, msg: Self) {
        session.receive_premature_commitment(hash, msg);
    }
}
