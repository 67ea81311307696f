//! Commitment ledger: mining window, mineable pool, block processing and
//! relayed commitments.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use assert_matches::assert_matches;
use llmq_core::{
    BitSet, BlockRef, ChainView, FinalCommitment, Hash256, LlmqError, LlmqParams, MessageHandler, MessageKind,
    PeerId, PublicKey, QuorumMembers, Signature,
};
use llmq_dkg::CommitmentSink;
use llmq_quorums::CommitmentLedger;
use llmq_store::MemoryStore;
use llmq_testkit::{MockChain, MockMasternodeList, QuorumFixture, RecordingMessenger};
use std::sync::Arc;

struct Setup {
    params: LlmqParams,
    chain: Arc<MockChain>,
    list: MockMasternodeList,
    members: Arc<QuorumMembers>,
    messenger: Arc<RecordingMessenger>,
    store: Arc<MemoryStore>,
    ledger: CommitmentLedger,
}

impl Setup {
    fn new() -> Self {
        let params = LlmqParams::llmq_test();
        let chain = Arc::new(MockChain::new());
        let list = MockMasternodeList::generate(8, 3);
        let members = Arc::new(QuorumMembers::new(Arc::new(list.clone())));
        let messenger = Arc::new(RecordingMessenger::new());
        let store = Arc::new(MemoryStore::new());
        let ledger = Self::ledger_over(&params, &chain, &members, &messenger, &store);
        Self {
            params,
            chain,
            list,
            members,
            messenger,
            store,
            ledger,
        }
    }

    fn ledger_over(
        params: &LlmqParams,
        chain: &Arc<MockChain>,
        members: &Arc<QuorumMembers>,
        messenger: &Arc<RecordingMessenger>,
        store: &Arc<MemoryStore>,
    ) -> CommitmentLedger {
        CommitmentLedger::new(
            params.clone(),
            chain.clone(),
            Arc::clone(members),
            messenger.clone(),
            store.clone(),
            16,
        )
    }

    fn block(&self, height: u32) -> BlockRef {
        self.chain.block_at_height(height).unwrap()
    }

    /// Honest DKG result for the quorum defined at `height`.
    fn fixture(&self, height: u32) -> QuorumFixture {
        let block = self.block(height);
        QuorumFixture::new(&self.params, block, self.list.ordered_quorum(&self.params, &block), 11)
    }
}

/// Same result as `fixture.commitment`, signed by the first `n` members only.
fn with_signers(fixture: &QuorumFixture, n: usize) -> FinalCommitment {
    let mut commitment = fixture.commitment.clone();
    let hash = commitment.commitment_hash().unwrap();
    let sigs: Vec<Signature> = fixture.members[..n]
        .iter()
        .map(|m| m.operator_key.sign(&hash))
        .collect();
    let keys: Vec<PublicKey> = fixture.members[..n]
        .iter()
        .map(|m| m.operator_key.public_key())
        .collect();
    commitment.signers = BitSet::from_indexes(fixture.params.size, 0..n);
    commitment.members_sig = Signature::aggregate_secure(&keys, &sigs);
    commitment
}

fn with_bad_members_sig(fixture: &QuorumFixture) -> FinalCommitment {
    let mut commitment = fixture.commitment.clone();
    let other = Hash256::sha256d(b"something else");
    let sigs: Vec<Signature> = fixture.members.iter().map(|m| m.operator_key.sign(&other)).collect();
    let keys: Vec<PublicKey> = fixture.members.iter().map(|m| m.operator_key.public_key()).collect();
    commitment.members_sig = Signature::aggregate_secure(&keys, &sigs);
    commitment
}

fn assert_invalid(result: llmq_core::Result<()>, code: &str) {
    assert_matches!(result, Err(LlmqError::Invalid { message }) if message.starts_with(code));
}

#[test]
fn test_mining_window() {
    let s = Setup::new();
    assert!(!s.ledger.is_mining_phase(24));
    assert!(!s.ledger.is_mining_phase(33));
    assert!(s.ledger.is_mining_phase(34));
    assert!(s.ledger.is_mining_phase(42));
    assert!(!s.ledger.is_mining_phase(43));
}

#[test]
fn test_null_commitment_offered_until_one_is_known() {
    let s = Setup::new();
    s.chain.mine_to(33);
    let quorum = s.block(24);

    assert_eq!(s.ledger.get_mineable_commitment(30).unwrap(), None);
    assert!(s.ledger.is_commitment_required(34).unwrap());
    let offered = s.ledger.get_mineable_commitment(34).unwrap().unwrap();
    assert!(offered.is_null());
    assert_eq!(offered.quorum_hash, quorum.hash);

    let fixture = s.fixture(24);
    let hash = s.ledger.add_mineable_commitment(fixture.commitment.clone()).unwrap();
    assert!(s.ledger.has_mineable_commitment(&hash));
    assert_eq!(s.ledger.get_mineable_commitment_by_hash(&hash), Some(fixture.commitment.clone()));
    assert_eq!(s.ledger.get_mineable_commitment(34).unwrap(), Some(fixture.commitment));
}

#[test]
fn test_commitment_with_more_signers_replaces_weaker_one() {
    let s = Setup::new();
    s.chain.mine_to(33);
    let fixture = s.fixture(24);
    let weak = with_signers(&fixture, 3);

    let weak_hash = s.ledger.add_mineable_commitment(weak.clone()).unwrap();
    let full_hash = s.ledger.add_mineable_commitment(fixture.commitment.clone()).unwrap();
    assert!(!s.ledger.has_mineable_commitment(&weak_hash));
    assert!(s.ledger.has_mineable_commitment(&full_hash));

    assert_eq!(s.ledger.add_mineable_commitment(weak), None);
    assert_eq!(s.ledger.add_mineable_commitment(fixture.commitment.clone()), None);
    assert_eq!(s.ledger.get_mineable_commitment(34).unwrap(), Some(fixture.commitment));
}

#[test]
fn test_invalid_commitment_is_not_mineable() {
    let s = Setup::new();
    s.chain.mine_to(33);
    let fixture = s.fixture(24);
    assert_eq!(s.ledger.add_mineable_commitment(with_bad_members_sig(&fixture)), None);
    assert!(s.ledger.get_mineable_commitment(34).unwrap().unwrap().is_null());
}

#[test]
fn test_commitment_rejects_bits_beyond_member_count() {
    let s = Setup::new();
    s.chain.mine_to(24);
    let fixture = s.fixture(24);
    let members = fixture.masternodes();
    assert!(fixture.commitment.verify(&fixture.quorum, &members, &s.params, true));
    assert!(!fixture.commitment.verify(&fixture.quorum, &members[..4], &s.params, true));
    assert!(!with_bad_members_sig(&fixture).verify(&fixture.quorum, &members, &s.params, true));
    assert!(with_bad_members_sig(&fixture).verify(&fixture.quorum, &members, &s.params, false));
}

#[test]
fn test_blocks_in_window_must_carry_a_commitment_until_one_is_mined() {
    let s = Setup::new();
    s.chain.mine_to(40);
    let fixture = s.fixture(24);
    let null = FinalCommitment::null(&s.params, s.block(24).hash);

    assert_invalid(s.ledger.process_block(&s.block(34), &[]), "bad-qc-missing");
    s.ledger.process_block(&s.block(34), &[null.clone()]).unwrap();
    assert!(!s.ledger.has_mined_commitment(&fixture.quorum.hash).unwrap());

    s.ledger.process_block(&s.block(35), &[fixture.commitment.clone()]).unwrap();
    let (mined, mined_in) = s.ledger.get_mined_commitment(&fixture.quorum.hash).unwrap().unwrap();
    assert_eq!(mined, fixture.commitment);
    assert_eq!(mined_in, s.block(35).hash);

    s.ledger.process_block(&s.block(36), &[]).unwrap();
    assert_invalid(s.ledger.process_block(&s.block(36), &[null]), "bad-qc-not-allowed");
    assert_invalid(
        s.ledger.process_block(&s.block(36), &[fixture.commitment]),
        "bad-qc-not-allowed",
    );
}

#[test]
fn test_mined_commitment_leaves_the_mineable_pool() {
    let s = Setup::new();
    s.chain.mine_to(35);
    let fixture = s.fixture(24);
    let hash = s.ledger.add_mineable_commitment(fixture.commitment.clone()).unwrap();

    s.ledger.process_block(&s.block(34), &[fixture.commitment.clone()]).unwrap();
    assert!(!s.ledger.has_mineable_commitment(&hash));
    assert!(!s.ledger.is_commitment_required(35).unwrap());
    assert_eq!(s.ledger.get_mineable_commitment(35).unwrap(), None);
}

#[test]
fn test_commitments_outside_window_are_rejected() {
    let s = Setup::new();
    s.chain.mine_to(45);
    let fixture = s.fixture(24);

    assert_invalid(
        s.ledger.process_block(&s.block(30), &[fixture.commitment.clone()]),
        "bad-qc-not-allowed",
    );
    assert_invalid(
        s.ledger.process_block(&s.block(44), &[fixture.commitment.clone()]),
        "bad-qc-not-allowed",
    );
    s.ledger.process_block(&s.block(44), &[]).unwrap();
}

#[test]
fn test_block_with_two_commitments_is_rejected() {
    let s = Setup::new();
    s.chain.mine_to(34);
    let fixture = s.fixture(24);
    let null = FinalCommitment::null(&s.params, fixture.quorum.hash);
    assert_invalid(
        s.ledger.process_block(&s.block(34), &[null, fixture.commitment]),
        "bad-qc-dup",
    );
}

#[test]
fn test_commitment_for_wrong_quorum_block_is_rejected() {
    let s = Setup::new();
    s.chain.mine_to(34);
    let off_interval = s.fixture(23);
    assert_invalid(
        s.ledger.process_block(&s.block(34), &[off_interval.commitment]),
        "bad-qc-block",
    );

    let fixture = s.fixture(24);
    assert_invalid(
        s.ledger.process_block(&s.block(34), &[with_bad_members_sig(&fixture)]),
        "bad-qc-invalid",
    );
    assert!(!s.ledger.has_mined_commitment(&fixture.quorum.hash).unwrap());
}

#[test]
fn test_undo_block_returns_commitment_to_pool() {
    let s = Setup::new();
    s.chain.mine_to(36);
    let fixture = s.fixture(24);
    s.ledger.process_block(&s.block(35), &[fixture.commitment.clone()]).unwrap();

    // Undoing an unrelated block leaves the mined record alone
    s.ledger.undo_block(&s.block(36), &[fixture.commitment.clone()]).unwrap();
    assert!(s.ledger.has_mined_commitment(&fixture.quorum.hash).unwrap());

    s.ledger.undo_block(&s.block(35), &[fixture.commitment.clone()]).unwrap();
    assert!(!s.ledger.has_mined_commitment(&fixture.quorum.hash).unwrap());
    assert!(s.ledger.has_mineable_commitment(&fixture.commitment.hash()));
    assert!(s.ledger.is_commitment_required(36).unwrap());
}

#[test]
fn test_relayed_commitment_is_added_and_relayed_once() {
    let s = Setup::new();
    s.chain.mine_to(33);
    let fixture = s.fixture(24);
    let payload = fixture.commitment.encode();

    s.ledger.process_message(PeerId(7), MessageKind::FinalCommitment, &payload);
    s.ledger.process_message(PeerId(8), MessageKind::FinalCommitment, &payload);

    assert!(s.ledger.has_mineable_commitment(&fixture.commitment.hash()));
    assert_eq!(s.messenger.relayed_of(MessageKind::FinalCommitment), vec![payload]);
    assert!(s.messenger.reports().is_empty());
}

#[test]
fn test_bad_relayed_commitments_are_punished() {
    let s = Setup::new();
    s.chain.mine_to(33);
    let fixture = s.fixture(24);
    let null = FinalCommitment::null(&s.params, fixture.quorum.hash);
    let off_interval = s.fixture(23);

    s.ledger.process_message(PeerId(1), MessageKind::FinalCommitment, &[0xde, 0xad]);
    s.ledger.process_message(PeerId(2), MessageKind::FinalCommitment, &null.encode());
    s.ledger
        .process_message(PeerId(3), MessageKind::FinalCommitment, &with_bad_members_sig(&fixture).encode());
    s.ledger
        .process_message(PeerId(4), MessageKind::FinalCommitment, &off_interval.commitment.encode());

    let reports = s.messenger.reports();
    let peers: Vec<PeerId> = reports.iter().map(|r| r.peer).collect();
    assert_eq!(peers, vec![PeerId(1), PeerId(2), PeerId(3), PeerId(4)]);
    assert!(reports.iter().all(|r| r.score == 100));
    assert!(s.messenger.relayed().is_empty());
}

#[test]
fn test_commitment_for_unknown_block_is_ignored() {
    let s = Setup::new();
    s.chain.mine_to(33);
    let mut fixture = s.fixture(24);
    fixture.commitment.quorum_hash = Hash256::sha256d(b"unknown");

    s.ledger
        .process_message(PeerId(5), MessageKind::FinalCommitment, &fixture.commitment.encode());
    assert!(s.messenger.reports().is_empty());
    assert!(s.messenger.relayed().is_empty());
}

#[test]
fn test_mined_commitments_survive_flush() {
    let s = Setup::new();
    s.chain.mine_to(35);
    let fixture = s.fixture(24);
    s.ledger.process_block(&s.block(35), &[fixture.commitment.clone()]).unwrap();
    s.ledger.flush_cache_to_disk().unwrap();

    let reopened = Setup::ledger_over(&s.params, &s.chain, &s.members, &s.messenger, &s.store);
    let (mined, mined_in) = reopened.get_mined_commitment(&fixture.quorum.hash).unwrap().unwrap();
    assert_eq!(mined, fixture.commitment);
    assert_eq!(mined_in, s.block(35).hash);
}
