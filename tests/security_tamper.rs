//! Security tests for tampering by peers and manifest holders.
//!
//! These tests verify that the engine correctly enforces integrity properties:
//! - Corrupted shards are excluded from reconstruction and their holder penalized
//! - Tampered ciphertext metadata fails authentication rather than yielding bytes
//! - Forged or unsigned audit proofs are rejected

mod common;
use common::fixtures::{test_data, TestConfig, TestNetwork};
use shardvault::{
    integrity,
    retrieval::RetrievalEngine,
    transport::AuditProof,
    ChallengePool, PeerRegistry, PeerTransport, VaultError,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_corrupted_shard_is_excluded_and_penalized() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let data = test_data(3000, 21);
    let file_id = net.engine.upload(&data, "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();

    let bad = manifest.descriptor(1).unwrap().assigned_peer_id;
    net.holder(&manifest, 1).corrupt_shard(file_id, 1).await.unwrap();
    // Make the honest holders slower so the corrupt shard is seen first
    for index in [0, 2, 3] {
        net.holder(&manifest, index)
            .set_latency(Duration::from_millis(100))
            .await
            .unwrap();
    }

    let before = net.engine.context().reputation.score(&bad);
    assert_eq!(net.engine.download(&file_id, "pw").await.unwrap(), data);

    let ctx = net.engine.context();
    assert!(ctx.reputation.score(&bad) < before);
    assert_eq!(ctx.reputation.counters(&bad).integrity_violations, 1);
    assert_eq!(ctx.metrics.snapshot().integrity_violations, 1);
    let record = net.registry.get_peer(&bad).await.unwrap();
    assert_eq!(record.reputation_score, ctx.reputation.score(&bad));

    println!("✓ Corrupted shard discarded, holder penalized");
}

#[tokio::test(start_paused = true)]
async fn test_corruption_beyond_redundancy_fails_closed() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(800, 22), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();

    for index in 0..3 {
        net.holder(&manifest, index).corrupt_shard(file_id, index).await.unwrap();
    }
    assert!(matches!(
        net.engine.download(&file_id, "pw").await,
        Err(VaultError::RetrievalFailure { verified: 1, required: 2, .. })
    ));

    println!("✓ Corrupted shards never reach the decoder");
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_holders_are_not_asked_again_on_retry() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(800, 26), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();

    let mut corrupt = Vec::new();
    for index in 0..3 {
        corrupt.push(manifest.descriptor(index).unwrap().assigned_peer_id);
        net.holder(&manifest, index).corrupt_shard(file_id, index).await.unwrap();
    }
    assert!(matches!(
        net.engine.download(&file_id, "pw").await,
        Err(VaultError::RetrievalFailure { verified: 1, .. })
    ));

    // One violation each, even though the download was retried
    let ctx = net.engine.context();
    for peer_id in &corrupt {
        assert_eq!(ctx.reputation.counters(peer_id).integrity_violations, 1);
    }
    assert_eq!(ctx.metrics.snapshot().integrity_violations, 3);
    // The honest holder's shard was kept from the first pass
    let honest = manifest.descriptor(3).unwrap().assigned_peer_id;
    assert_eq!(ctx.metrics.snapshot().shards_fetched, 1);
    assert_eq!(ctx.reputation.counters(&honest).integrity_violations, 0);

    println!("✓ Retry skipped holders that served bad bytes");
}

#[tokio::test(start_paused = true)]
async fn test_tampered_tag_or_nonce_fails_authentication() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(256, 23), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    let retrieval = RetrievalEngine::new(net.engine.context().clone());

    let mut bad_tag = manifest.clone();
    bad_tag.encryption.auth_tag[0] ^= 0x80;
    assert!(matches!(
        retrieval.fetch(&bad_tag, "pw").await,
        Err(VaultError::AuthenticationFailure)
    ));

    let mut bad_nonce = manifest.clone();
    bad_nonce.encryption.nonce[11] ^= 0x01;
    assert!(matches!(
        retrieval.fetch(&bad_nonce, "pw").await,
        Err(VaultError::AuthenticationFailure)
    ));

    let mut bad_salt = manifest.clone();
    bad_salt.encryption.salt[0] ^= 0x01;
    assert!(matches!(
        retrieval.fetch(&bad_salt, "pw").await,
        Err(VaultError::AuthenticationFailure)
    ));

    println!("✓ Tampered tag, nonce and salt all fail authentication");
}

#[tokio::test(start_paused = true)]
async fn test_swapped_digests_are_caught() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(256, 24), "pw").await.unwrap();
    let mut manifest = net.engine.manifest(&file_id).await.unwrap();

    // A manifest claiming other shard contents cannot verify any fetched shard
    for descriptor in &mut manifest.shards {
        descriptor.content_digest = integrity::digest(b"forged");
    }
    let retrieval = RetrievalEngine::new(net.engine.context().clone());
    assert!(matches!(
        retrieval.fetch(&manifest, "pw").await,
        Err(VaultError::RetrievalFailure { verified: 0, .. })
    ));

    println!("✓ Forged digests yield no verified shards");
}

#[tokio::test(start_paused = true)]
async fn test_audit_proof_cannot_be_forged_without_shard() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(256, 25), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    let descriptor = manifest.descriptor(0).unwrap();
    let holder = net.registry.get_peer(&descriptor.assigned_peer_id).await.unwrap();
    let transport = &net.engine.context().transport;

    let bytes = transport.get_shard(&holder, &file_id, 0).await.unwrap();
    let mut pool = ChallengePool::generate(&bytes, 2);
    let token = pool.take().unwrap();
    let challenge = token.challenge(file_id, 0);
    let answer = transport.audit_challenge(&holder, &challenge).await.unwrap();
    assert_eq!(answer.proof, token.expected);
    assert!(answer.verify_signature(&challenge, &holder.public_key));

    // The digest published in the manifest is not enough to answer
    let from_digest = integrity::audit_proof(descriptor.content_digest.as_bytes(), &challenge.nonce);
    assert_ne!(from_digest, token.expected);

    // Replaying the answer against a fresh nonce fails
    let fresh = pool.take().unwrap();
    assert_ne!(answer.proof, fresh.expected);
    assert!(!answer.verify_signature(&fresh.challenge(file_id, 0), &holder.public_key));

    // An unsigned proof is rejected even if the value is right
    let unsigned = AuditProof {
        proof: token.expected,
        signature: vec![0; 64],
    };
    assert!(!unsigned.verify_signature(&challenge, &holder.public_key));

    println!("✓ Audit proofs need the shard bytes and are bound to nonce and key");
}
