//! Audit scheduling, failure detection and repair.

mod common;
use common::{
    assertions::{assert_download_matches, assert_manifest_well_formed},
    fixtures::{peer_key, test_data, TestConfig, TestNetwork},
};
use shardvault::{
    audit::{AuditResult, ShardAuditState},
    clock::Clock,
    peer::MemoryPeer,
    Outcome,
};
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn test_honest_round_verifies_and_reschedules() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(2000, 41), "pw").await.unwrap();
    let audit = net.engine.audit();
    assert_eq!(audit.watched_files(), 1);
    assert_eq!(audit.shard_state(&file_id, 0), Some(ShardAuditState::Unaudited));

    let report = net.audit_round().await;
    assert_eq!(report.challenged, 4);
    assert_eq!(report.verified, 4);
    assert!(report.repaired.is_empty());

    let now = net.clock.now();
    let interval = net.engine.context().config.audit_interval_secs;
    for index in 0..4 {
        assert_eq!(
            audit.shard_state(&file_id, index),
            Some(ShardAuditState::Scheduled { due: now + interval })
        );
        assert_eq!(audit.last_result(&file_id, index), Some(AuditResult::Verified));
    }

    // Nothing is due again until the interval has passed
    let again = audit.tick(now).await;
    assert_eq!(again.challenged, 0);

    let ctx = net.engine.context();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    for holder in manifest.holders() {
        assert_eq!(ctx.reputation.counters(holder).audit_passes, 1);
    }
    let snapshot = ctx.metrics.snapshot();
    assert_eq!(snapshot.audits_total, 4);
    assert_eq!(snapshot.audits_passed, 4);

    println!("✓ Honest holders verified and rescheduled one interval later");
}

#[tokio::test(start_paused = true)]
async fn test_lost_shard_is_repaired_elsewhere() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let data = test_data(3000, 42);
    let file_id = net.engine.upload(&data, "pw").await.unwrap();
    let before = net.engine.manifest(&file_id).await.unwrap();
    let old_holder = before.descriptor(2).unwrap().assigned_peer_id;

    net.holder(&before, 2).drop_shard(file_id, 2).await.unwrap();

    let report = net.audit_round().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.repaired, vec![(file_id, 2)]);

    let after = net.engine.manifest(&file_id).await.unwrap();
    assert_manifest_well_formed(&after);
    let repaired = after.descriptor(2).unwrap();
    assert_eq!(repaired.assignment_version, 1);
    assert_ne!(repaired.assigned_peer_id, old_holder);
    assert!(before.holders().all(|h| *h != repaired.assigned_peer_id));
    // Untouched shards keep their holders
    for index in [0, 1, 3] {
        assert_eq!(after.descriptor(index), before.descriptor(index));
    }

    let ctx = net.engine.context();
    assert_eq!(ctx.reputation.counters(&old_holder).audit_failures, 1);
    assert_eq!(ctx.reputation.load(&old_holder), 0);
    assert_eq!(ctx.reputation.load(&repaired.assigned_peer_id), 1);
    assert_eq!(ctx.metrics.snapshot().repairs, 1);

    // The new holder joins the regular schedule with a fresh set of challenges
    let audit = net.engine.audit();
    let next_due = net.clock.now() + ctx.config.audit_interval_secs;
    assert_eq!(
        audit.shard_state(&file_id, 2),
        Some(ShardAuditState::Scheduled { due: next_due })
    );
    assert_eq!(
        audit.remaining_challenges(&file_id, 2),
        Some(ctx.config.audit_challenges_per_shard)
    );
    assert_eq!(audit.manifest(&file_id).unwrap(), after);
    assert_eq!(audit.tick(net.clock.now()).await.challenged, 0);

    assert_download_matches(&net, &file_id, "pw", &data).await;

    println!("✓ Missing shard regenerated on a fresh peer");
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_shard_fails_audit_and_is_replaced() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let data = test_data(1500, 43);
    let file_id = net.engine.upload(&data, "pw").await.unwrap();
    let before = net.engine.manifest(&file_id).await.unwrap();
    let old_handle = net.holder(&before, 0);

    old_handle.corrupt_shard(file_id, 0).await.unwrap();

    let report = net.audit_round().await;
    assert_eq!(report.verified, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.repaired, vec![(file_id, 0)]);

    // The old holder is asked to drop its bad copy in the background
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(old_handle.stats().await.unwrap().shard_count, 0);

    let after = net.engine.manifest(&file_id).await.unwrap();
    assert_ne!(
        after.descriptor(0).unwrap().assigned_peer_id,
        before.descriptor(0).unwrap().assigned_peer_id
    );
    assert_download_matches(&net, &file_id, "pw", &data).await;

    // The replacement passes its first audit
    let next = net.audit_round().await;
    assert_eq!(next.verified, 4);

    println!("✓ Corrupted shard replaced and old copy discarded");
}

#[tokio::test(start_paused = true)]
async fn test_holder_keeping_only_the_digest_fails_audit() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let data = test_data(2500, 51);
    let file_id = net.engine.upload(&data, "pw").await.unwrap();
    let before = net.engine.manifest(&file_id).await.unwrap();
    let lazy = before.descriptor(1).unwrap().assigned_peer_id;

    // Frees the space but can still hash the digest it was given
    net.holder(&before, 1).keep_digest_only(file_id, 1).await.unwrap();

    let report = net.audit_round().await;
    assert_eq!(report.verified, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.repaired, vec![(file_id, 1)]);
    assert_eq!(
        net.engine.context().reputation.counters(&lazy).audit_failures,
        1
    );

    let after = net.engine.manifest(&file_id).await.unwrap();
    assert_ne!(after.descriptor(1).unwrap().assigned_peer_id, lazy);
    assert_download_matches(&net, &file_id, "pw", &data).await;

    println!("✓ Digest without the bytes does not pass an audit");
}

#[tokio::test(start_paused = true)]
async fn test_spent_challenges_are_refilled_from_the_holder() {
    let config = TestConfig {
        audit_challenges: 2,
        ..Default::default()
    };
    let net = TestNetwork::new(config).await;
    let file_id = net.engine.upload(&test_data(700, 52), "pw").await.unwrap();
    let audit = net.engine.audit();
    assert_eq!(audit.remaining_challenges(&file_id, 0), Some(2));

    for remaining in [1, 0] {
        assert_eq!(net.audit_round().await.verified, 4);
        assert_eq!(audit.remaining_challenges(&file_id, 0), Some(remaining));
    }

    // Empty pool: the round downloads each shard, checks it and refills
    assert_eq!(net.audit_round().await.verified, 4);
    for index in 0..4 {
        assert_eq!(audit.remaining_challenges(&file_id, index), Some(2));
    }

    // A holder that lost its shard is caught by the refill download as well
    let config = TestConfig {
        audit_challenges: 1,
        ..Default::default()
    };
    let net = TestNetwork::new(config).await;
    let file_id = net.engine.upload(&test_data(700, 53), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    assert_eq!(net.audit_round().await.verified, 4);
    net.holder(&manifest, 2).drop_shard(file_id, 2).await.unwrap();

    let report = net.audit_round().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.repaired, vec![(file_id, 2)]);

    println!("✓ Challenge pools refill from a verified download");
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_holder_repaired_after_tolerance() {
    // Tolerance 2: repair on the third consecutive unreachable audit
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(800, 44), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    let silent = manifest.descriptor(1).unwrap().assigned_peer_id;
    net.holder(&manifest, 1).set_offline(true).await.unwrap();

    for round in 1..=2 {
        let report = net.audit_round().await;
        assert_eq!(report.unreachable, 1, "round {round}");
        assert!(report.repaired.is_empty(), "round {round}");
        assert_eq!(
            net.engine.audit().last_result(&file_id, 1),
            Some(AuditResult::Unreachable)
        );
    }

    let report = net.audit_round().await;
    assert_eq!(report.unreachable, 1);
    assert_eq!(report.repaired, vec![(file_id, 1)]);

    let ctx = net.engine.context();
    assert_eq!(ctx.reputation.counters(&silent).timeouts, 3);
    let after = net.engine.manifest(&file_id).await.unwrap();
    assert_ne!(after.descriptor(1).unwrap().assigned_peer_id, silent);

    println!("✓ Holder silent for three rounds lost its shard");
}

#[tokio::test(start_paused = true)]
async fn test_brief_outage_is_forgiven() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(800, 45), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    let handle = net.holder(&manifest, 3);

    handle.set_offline(true).await.unwrap();
    net.audit_round().await;
    net.audit_round().await;
    handle.set_offline(false).await.unwrap();

    // A verified audit resets the count, so two more outages are tolerated
    assert_eq!(net.audit_round().await.verified, 4);
    handle.set_offline(true).await.unwrap();
    for _ in 0..2 {
        assert!(net.audit_round().await.repaired.is_empty());
    }
    assert_eq!(net.engine.manifest(&file_id).await.unwrap(), manifest);

    println!("✓ Consecutive count resets after a verified audit");
}

#[tokio::test(start_paused = true)]
async fn test_proof_signed_with_wrong_key_fails() {
    let mut net = TestNetwork::new(TestConfig::with_peers(3)).await;

    // Registers one key but signs with another
    let mut impostor = MemoryPeer::spawn_with_key("mem://impostor", net.config.capacity, peer_key(100));
    impostor.public_key = peer_key(101).verifying_key().to_bytes();
    let impostor = net
        .network
        .register(net.registry.as_ref(), impostor)
        .await
        .unwrap();
    let impostor_id = impostor.0;
    net.peers.push(impostor);

    let data = test_data(600, 46);
    let file_id = net.engine.upload(&data, "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    let index = manifest
        .shards
        .iter()
        .find(|d| d.assigned_peer_id == impostor_id)
        .map(|d| d.shard_index)
        .expect("every peer holds a shard when n equals the pool size");

    // Somewhere to move the shard to
    let spare = net.add_peer().await;

    let report = net.audit_round().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.repaired, vec![(file_id, index)]);
    assert_eq!(
        net.engine.context().reputation.counters(&impostor_id).audit_failures,
        1
    );

    let after = net.engine.manifest(&file_id).await.unwrap();
    assert_eq!(after.descriptor(index).unwrap().assigned_peer_id, spare);
    assert_download_matches(&net, &file_id, "pw", &data).await;

    println!("✓ Proof under an unregistered key rejected");
}

#[tokio::test(start_paused = true)]
async fn test_repair_without_spare_peer_is_reported() {
    // Every peer already holds a shard, so there is nowhere to move one
    let net = TestNetwork::new(TestConfig::with_peers(4)).await;
    let file_id = net.engine.upload(&test_data(500, 47), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    net.holder(&manifest, 0).drop_shard(file_id, 0).await.unwrap();

    let report = net.audit_round().await;
    assert_eq!(report.failed, 1);
    assert!(report.repaired.is_empty());
    assert_eq!(report.repair_failures, 1);
    assert_eq!(net.engine.context().metrics.snapshot().repair_failures, 1);
    assert_eq!(net.engine.manifest(&file_id).await.unwrap(), manifest);

    println!("✓ Failed repair leaves the manifest untouched");
}

#[tokio::test(start_paused = true)]
async fn test_unwatched_file_is_not_audited() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(100, 48), "pw").await.unwrap();
    assert!(net.engine.audit().unwatch(&file_id));
    assert!(!net.engine.audit().unwatch(&file_id));

    assert_eq!(net.audit_round().await.challenged, 0);

    println!("✓ Unwatched files are skipped");
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_audits_until_shutdown() {
    let net = TestNetwork::new(TestConfig::default()).await;
    net.engine.upload(&test_data(900, 49), "pw").await.unwrap();

    let (shutdown, receiver) = watch::channel(false);
    let audit = net.engine.audit().clone();
    let task = tokio::spawn(async move { audit.run(receiver).await });

    let metrics = net.engine.context().metrics.clone();
    for _ in 0..100 {
        if metrics.snapshot().audits_total >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown.send(true).unwrap();
    task.await.unwrap();

    // The manual clock never moved, so only the first round found work
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.audits_total, 4);
    assert_eq!(snapshot.audits_passed, 4);

    println!("✓ Audit loop ran a round and stopped on shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_audit_passes_raise_holder_scores() {
    let net = TestNetwork::new(TestConfig::default()).await;
    let file_id = net.engine.upload(&test_data(100, 50), "pw").await.unwrap();
    let manifest = net.engine.manifest(&file_id).await.unwrap();
    let holder = manifest.descriptor(0).unwrap().assigned_peer_id;
    let ctx = net.engine.context();

    let start = ctx.reputation.score(&holder);
    net.audit_round().await;
    let after_one = ctx.reputation.score(&holder);
    net.audit_round().await;
    let after_two = ctx.reputation.score(&holder);
    assert!(after_one > start);
    assert!(after_two > after_one);
    assert!(after_two - after_one < after_one - start);

    // A single failure outweighs both passes
    ctx.report(&holder, Outcome::AuditFail).await;
    assert!(ctx.reputation.score(&holder) < start);

    println!("✓ Audit passes accumulate with diminishing returns");
}
