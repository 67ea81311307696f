//! DKG rounds driven directly through `DkgSession`, without the phase
//! handler: every node sees every message in the same order.

use assert_matches::assert_matches;
use llmq_core::{
    BlockRef, FinalCommitment, Hash256, LlmqParams, PeerId, QuorumMembers, Signature,
};
use llmq_crypto::CryptoWorker;
use llmq_dkg::{
    batch_verify_message_sigs, ContributionStore, DkgMessage, DkgSession, PreVerify, SessionDeps,
    SimulatedErrorKind, SimulatedErrors,
};
use llmq_store::MemoryStore;
use llmq_testkit::MockMasternodeList;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;

struct Round {
    params: LlmqParams,
    quorum: BlockRef,
    sessions: Vec<DkgSession>,
    stores: Vec<Arc<ContributionStore>>,
    rng: ChaCha20Rng,
}

fn payload_hash<M: DkgMessage>(msg: &M) -> Hash256 {
    Hash256::sha256d(&msg.encode().unwrap())
}

fn new_round(faults: &[(usize, SimulatedErrorKind)]) -> Round {
    llmq_testkit::init_test_tracing();
    let params = LlmqParams::llmq_test();
    let quorum = BlockRef::new(Hash256::sha256d(b"quorum block"), 24);
    let list = MockMasternodeList::generate(5, 11);
    let ordered = list.ordered_quorum(&params, &quorum);
    let members = QuorumMembers::new(Arc::new(list.clone())).members(&params, &quorum);
    let worker = Arc::new(CryptoWorker::new(2).unwrap());

    let mut sessions = Vec::new();
    let mut stores = Vec::new();
    for (i, local) in ordered.iter().enumerate() {
        let simulated_errors = Arc::new(SimulatedErrors::new());
        for (node, kind) in faults {
            if *node == i {
                simulated_errors.set_simulated_error_rate(*kind, 1.0);
            }
        }
        let store = Arc::new(ContributionStore::new(Arc::new(MemoryStore::new()), 64));
        let deps = SessionDeps {
            worker: Arc::clone(&worker),
            contributions: Arc::clone(&store),
            simulated_errors,
        };
        let session = DkgSession::new(params.clone(), quorum, &members, Some(local), deps).unwrap();
        assert_eq!(session.my_member_index(), Some(i));
        sessions.push(session);
        stores.push(store);
    }

    Round {
        params,
        quorum,
        sessions,
        stores,
        rng: ChaCha20Rng::seed_from_u64(5),
    }
}

impl Round {
    fn contribute(&mut self) -> usize {
        let msgs: Vec<_> = self
            .sessions
            .iter_mut()
            .filter_map(|s| s.contribute(&mut self.rng))
            .collect();
        for session in &mut self.sessions {
            for msg in &msgs {
                assert_eq!(session.pre_verify_contribution(msg), PreVerify::Accept);
                session.receive_contribution(payload_hash(msg), msg.clone());
            }
        }
        msgs.len()
    }

    fn complain(&mut self) -> usize {
        let msgs: Vec<_> = self
            .sessions
            .iter_mut()
            .filter_map(|s| s.verify_and_complain(&mut self.rng))
            .collect();
        for session in &mut self.sessions {
            for msg in &msgs {
                assert_eq!(session.pre_verify_complaint(msg), PreVerify::Accept);
                session.receive_complaint(payload_hash(msg), msg.clone());
            }
        }
        msgs.len()
    }

    fn justify(&mut self) -> usize {
        let msgs: Vec<_> = self
            .sessions
            .iter_mut()
            .filter_map(|s| s.verify_and_justify(&mut self.rng))
            .collect();
        for session in &mut self.sessions {
            for msg in &msgs {
                assert_eq!(session.pre_verify_justification(msg), PreVerify::Accept);
                session.receive_justification(payload_hash(msg), msg.clone());
            }
        }
        msgs.len()
    }

    /// Returns how many premature commitments each node accepted.
    fn commit(&mut self) -> Vec<usize> {
        let msgs: Vec<_> = self
            .sessions
            .iter_mut()
            .filter_map(DkgSession::verify_and_commit)
            .collect();
        let mut accepted = vec![0; self.sessions.len()];
        for (i, session) in self.sessions.iter_mut().enumerate() {
            for msg in &msgs {
                if session.pre_verify_premature_commitment(msg) == PreVerify::Accept {
                    session.receive_premature_commitment(payload_hash(msg), msg.clone());
                    accepted[i] += 1;
                }
            }
        }
        accepted
    }

    fn run(&mut self) -> Vec<FinalCommitment> {
        self.contribute();
        self.complain();
        self.justify();
        self.commit();
        self.sessions[0].finalize_commitments()
    }
}

fn assert_shares_recover_quorum_key(round: &Round, commitment: &FinalCommitment) {
    let hash = Hash256::sha256d(b"threshold check");
    let shares: Vec<_> = round
        .sessions
        .iter()
        .filter(|s| s.quorum_sk_share().is_some())
        .take(round.params.threshold)
        .map(|s| {
            let idx = s.my_member_index().unwrap();
            let id = llmq_core::BlsId::from_hash(&s.members()[idx].pro_tx_hash);
            (id, s.quorum_sk_share().unwrap().sign(&hash))
        })
        .collect();
    let sig = Signature::recover(&shares).unwrap();
    assert!(sig.verify(commitment.quorum_public_key.as_ref().unwrap(), &hash));
}

#[test]
fn test_honest_round_produces_one_commitment() {
    let mut round = new_round(&[]);
    assert_eq!(round.contribute(), 5);
    assert_eq!(round.complain(), 0);
    assert_eq!(round.justify(), 0);
    assert_eq!(round.commit(), vec![5; 5]);

    let finals = round.sessions[0].finalize_commitments();
    assert_eq!(finals.len(), 1);
    let fc = &finals[0];
    assert_eq!(fc.quorum_hash, round.quorum.hash);
    assert_eq!(fc.count_signers(), 5);
    assert_eq!(fc.count_valid_members(), 5);
    assert!(fc.verify(&round.quorum, &round.sessions[0].members(), &round.params, true));

    // Every node reaches the same result
    for session in &round.sessions[1..] {
        assert_eq!(session.finalize_commitments(), finals);
    }
    assert_shares_recover_quorum_key(&round, fc);

    let dealer = round.sessions[0].members()[3].pro_tx_hash;
    let stored = round.stores[1]
        .read_vvec_contribution(round.params.llmq_type, round.quorum.hash, dealer)
        .unwrap();
    assert_eq!(stored.map(|v| v.len()), Some(round.params.threshold));
}

#[test]
fn test_lying_dealer_is_justified_and_kept() {
    let mut round = new_round(&[(2, SimulatedErrorKind::ContributionLie)]);
    round.contribute();
    assert_eq!(round.complain(), 1);
    assert_eq!(round.justify(), 1);
    round.commit();

    let finals = round.sessions[0].finalize_commitments();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].count_valid_members(), 5);
    assert!(!round.sessions[0].is_bad_member(2));
    assert_shares_recover_quorum_key(&round, &finals[0]);
}

#[test]
fn test_silent_member_is_voted_out() {
    let mut round = new_round(&[(4, SimulatedErrorKind::ContributionOmit)]);
    assert_eq!(round.contribute(), 4);
    assert_eq!(round.complain(), 5);
    for session in &round.sessions {
        assert!(session.is_bad_member(4));
    }
    round.justify();
    // The silent member's own view excludes itself, so nobody accepts it
    assert_eq!(round.commit(), vec![4; 5]);

    let finals = round.sessions[1].finalize_commitments();
    assert_eq!(finals.len(), 1);
    let fc = &finals[0];
    assert_eq!(fc.count_valid_members(), 4);
    assert!(!fc.valid_members.get(4));
    assert_eq!(fc.count_signers(), 4);
    assert!(fc.verify(&round.quorum, &round.sessions[1].members(), &round.params, true));
}

#[test]
fn test_withheld_commitments_leave_nothing_to_finalize() {
    let faults: Vec<_> = (0..3).map(|i| (i, SimulatedErrorKind::CommitOmit)).collect();
    let mut round = new_round(&faults);
    // Two commitments remain, below min_size
    assert!(round.run().is_empty());
}

#[test]
fn test_pre_verification_rejects_malformed_messages() {
    let mut round = new_round(&[]);
    let msg = round.sessions[0].contribute(&mut round.rng).unwrap();
    let session = &round.sessions[1];

    let mut short = msg.clone();
    short.vvec.pop();
    assert_eq!(session.pre_verify_contribution(&short), PreVerify::Ban);

    let mut stranger = msg.clone();
    stranger.header.pro_tx_hash = Hash256::sha256d(b"stranger");
    assert_eq!(session.pre_verify_contribution(&stranger), PreVerify::Ban);

    let mut other_quorum = msg.clone();
    other_quorum.header.quorum_hash = Hash256::sha256d(b"elsewhere");
    assert_eq!(session.pre_verify_contribution(&other_quorum), PreVerify::Ignore);

    let hash = payload_hash(&msg);
    round.sessions[1].receive_contribution(hash, msg.clone());
    assert_eq!(round.sessions[1].pre_verify_contribution(&msg), PreVerify::Ignore);
}

#[test]
fn test_batch_signature_check_blames_the_forger() {
    let mut round = new_round(&[]);
    let a = round.sessions[0].contribute(&mut round.rng).unwrap();
    let b = round.sessions[1].contribute(&mut round.rng).unwrap();
    let mut forged = round.sessions[2].contribute(&mut round.rng).unwrap();
    forged.sig = b.sig;

    let session = &round.sessions[3];
    let batch = vec![
        (PeerId(1), payload_hash(&a), a.clone()),
        (PeerId(2), payload_hash(&b), b.clone()),
        (PeerId(3), payload_hash(&forged), forged.clone()),
    ];
    let bad = batch_verify_message_sigs(session, &batch);
    assert_eq!(bad.into_iter().collect::<Vec<_>>(), vec![PeerId(3)]);

    // One sender for the whole batch takes the blame without individual checks
    let same_peer = vec![
        (PeerId(9), payload_hash(&a), a),
        (PeerId(9), payload_hash(&forged), forged),
    ];
    let bad = batch_verify_message_sigs(session, &same_peer);
    assert_matches!(bad.iter().next(), Some(PeerId(9)));

    let clean = vec![(PeerId(2), payload_hash(&b), b)];
    assert!(batch_verify_message_sigs(session, &clean).is_empty());
}
