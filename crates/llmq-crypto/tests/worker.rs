//! CryptoWorker behaviour across the pool boundary.

use llmq_core::{BlsId, Hash256, PublicKey, SecretKey, Signature, VerificationVector};
use llmq_crypto::CryptoWorker;
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::time::Duration;

fn worker() -> CryptoWorker {
    CryptoWorker::new(4).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_parallel_aggregation_matches_sequential(scalars in proptest::collection::vec(1u64..u64::MAX, 1..80)) {
        let worker = worker();
        let sks: Vec<SecretKey> = scalars.iter().map(|n| SecretKey::from_u64(*n).unwrap()).collect();
        let pks: Vec<PublicKey> = sks.iter().map(SecretKey::public_key).collect();
        let hash = Hash256::sha256d(b"aggregate");
        let sigs: Vec<Signature> = sks.iter().map(|k| k.sign(&hash)).collect();

        prop_assert_eq!(worker.aggregate_secret_keys(&sks, true), worker.aggregate_secret_keys(&sks, false));
        prop_assert_eq!(worker.aggregate_public_keys(&pks, true), worker.aggregate_public_keys(&pks, false));
        prop_assert_eq!(worker.aggregate_signatures(&sigs, true), worker.aggregate_signatures(&sigs, false));
    }
}

#[test]
fn test_contribution_shares_flag_only_the_bad_one() {
    let worker = worker();
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let ids: Vec<BlsId> = (1..=12u64).map(BlsId::from_u64).collect();
    let me = ids[4];

    let mut vvecs: Vec<VerificationVector> = Vec::new();
    let mut shares: Vec<SecretKey> = Vec::new();
    for _ in 0..12 {
        let (vvec, dealt) = worker.generate_contributions_with_rng(&mut rng, 3, &ids).unwrap();
        vvecs.push(vvec);
        shares.push(dealt[4].clone());
    }
    shares[9] = SecretKey::from_u64(77).unwrap();

    for (parallel, aggregated) in [(true, true), (false, true), (true, false), (false, false)] {
        let ok = worker.verify_contribution_shares(&me, &vvecs, &shares, parallel, aggregated);
        let expected: Vec<bool> = (0..12).map(|i| i != 9).collect();
        assert_eq!(ok, expected, "parallel={parallel} aggregated={aggregated}");
    }
}

#[test]
fn test_generated_shares_match_public_shares() {
    let worker = worker();
    let ids: Vec<BlsId> = (1..=5u64).map(BlsId::from_u64).collect();
    let (vvec, shares) = worker.generate_contributions(3, &ids).unwrap();
    assert_eq!(vvec.len(), 3);
    for (id, share) in ids.iter().zip(&shares) {
        assert_eq!(worker.build_pub_key_share(&vvec, id), Some(share.public_key()));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_async_verification_mixed_batch() {
    let worker = worker();
    let mut futures = Vec::new();
    let mut expected = Vec::new();
    for i in 1..=20u64 {
        let sk = SecretKey::from_u64(i).unwrap();
        let hash = Hash256::sha256d(&i.to_le_bytes());
        let valid = i % 7 != 0;
        let signed = if valid { hash } else { Hash256::sha256d(b"other") };
        futures.push(worker.async_verify_sig(sk.sign(&signed), sk.public_key(), hash, || false));
        expected.push(valid);
    }
    worker.flush_verify_queue();
    let results = futures::future::join_all(futures).await;
    assert_eq!(results, expected);

    for _ in 0..100 {
        if !worker.is_async_verify_in_progress() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!worker.is_async_verify_in_progress());
}

#[tokio::test(flavor = "current_thread")]
async fn test_duplicate_message_hashes_verify_individually() {
    let worker = worker();
    let hash = Hash256::sha256d(b"same");
    let a = SecretKey::from_u64(1).unwrap();
    let b = SecretKey::from_u64(2).unwrap();
    let fa = worker.async_verify_sig(a.sign(&hash), a.public_key(), hash, || false);
    let fb = worker.async_verify_sig(b.sign(&hash), b.public_key(), hash, || false);
    let fc = worker.async_verify_sig(a.sign(&hash), b.public_key(), hash, || false);
    worker.flush_verify_queue();
    assert_eq!(futures::join!(fa, fb, fc), (true, true, false));
}

#[tokio::test(flavor = "current_thread")]
async fn test_cancelled_request_resolves_false() {
    let worker = worker();
    let sk = SecretKey::from_u64(5).unwrap();
    let hash = Hash256::sha256d(b"cancel");
    let ok = worker
        .async_verify_sig(sk.sign(&hash), sk.public_key(), hash, || true)
        .await;
    assert!(!ok);
}

#[test]
fn test_callback_variants_deliver_results() {
    let worker = worker();
    let sk = SecretKey::from_u64(9).unwrap();
    let pk = sk.public_key();
    let hash = Hash256::sha256d(b"cb");
    let (tx, rx) = std::sync::mpsc::channel();
    worker.async_sign_with_callback(sk, hash, move |sig| {
        let _ = tx.send(sig);
    });
    let sig = rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    worker.async_verify_sig_with_callback(sig, pk, hash, || false, move |ok| {
        let _ = tx.send(ok);
    });
    worker.flush_verify_queue();
    assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
}
