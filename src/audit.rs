//! Proof-of-retrievability audits.
//!
//! Every watched shard moves through
//!
//! ```text
//! Unaudited -> Scheduled -> Challenged -> {Verified, Failed, Unreachable} -> Scheduled
//! ```
//!
//! A challenge carries a nonce the holder has never seen; the holder answers
//! with `H(tag || shard || nonce)` signed by its registered key. The auditor
//! never keeps shard bytes, so the answers are precomputed into a
//! [`ChallengePool`] while the bytes pass through the engine at upload and
//! repair. Each token is spent once. When a shard's pool is empty the next
//! audit downloads the shard, checks it against the manifest digest and
//! refills the pool from it.
//!
//! A wrong proof, a bad signature or a missing shard is `Failed` and
//! triggers repair immediately.
//! A silent holder is `Unreachable`, and repair follows once that has happened
//! more than `unreachable_tolerance` times in a row.
//!
//! [`AuditEngine::tick`] runs one round at a given clock reading, which keeps
//! the scheduler deterministic under a [`crate::clock::ManualClock`];
//! [`AuditEngine::run`] drives rounds from a timer until shut down.

use crate::api::EngineContext;
use crate::config::AUDIT_NONCE_LEN;
use crate::distributor::ShardDistributor;
use crate::integrity::{self, Digest};
use crate::manifest::{FileId, FileManifest, ShardDescriptor};
use crate::metrics::EngineMetrics;
use crate::registry::PeerRecord;
use crate::reputation::Outcome;
use crate::transport::{self, AuditChallenge};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, debug_span, info, warn, Instrument};

/// A nonce and the answer an honest holder of the shard gives to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    pub nonce: [u8; AUDIT_NONCE_LEN],
    pub expected: Digest,
}

impl ChallengeToken {
    pub fn challenge(&self, file_id: FileId, shard_index: u16) -> AuditChallenge {
        AuditChallenge {
            file_id,
            shard_index,
            nonce: self.nonce,
        }
    }
}

/// Unspent challenges for one shard.
#[derive(Debug, Clone, Default)]
pub struct ChallengePool {
    tokens: Vec<ChallengeToken>,
}

impl ChallengePool {
    /// Draws `count` random nonces and answers each from `shard_bytes`.
    pub fn generate(shard_bytes: &[u8], count: usize) -> Self {
        let tokens = (0..count)
            .map(|_| {
                let mut nonce = [0u8; AUDIT_NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                ChallengeToken {
                    nonce,
                    expected: integrity::audit_proof(shard_bytes, &nonce),
                }
            })
            .collect();
        Self { tokens }
    }

    /// Removes one token; a token is never handed out twice.
    pub fn take(&mut self) -> Option<ChallengeToken> {
        self.tokens.pop()
    }

    pub fn remaining(&self) -> usize {
        self.tokens.len()
    }
}

/// Where a shard is in its audit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAuditState {
    Unaudited,
    /// Next challenge due at this clock reading
    Scheduled { due: u64 },
    Challenged,
    Verified,
    Failed,
    Unreachable,
}

/// Result of one challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResult {
    Verified,
    Failed,
    Unreachable,
}

impl AuditResult {
    fn state(self) -> ShardAuditState {
        match self {
            AuditResult::Verified => ShardAuditState::Verified,
            AuditResult::Failed => ShardAuditState::Failed,
            AuditResult::Unreachable => ShardAuditState::Unreachable,
        }
    }

    fn outcome(self) -> Outcome {
        match self {
            AuditResult::Verified => Outcome::AuditPass,
            AuditResult::Failed => Outcome::AuditFail,
            AuditResult::Unreachable => Outcome::Timeout,
        }
    }
}

/// Summary of one [`AuditEngine::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub challenged: usize,
    pub verified: usize,
    pub failed: usize,
    pub unreachable: usize,
    /// Shards moved to a new holder this round
    pub repaired: Vec<(FileId, u16)>,
    pub repair_failures: usize,
}

#[derive(Debug, Clone)]
struct TrackedShard {
    state: ShardAuditState,
    last_result: Option<AuditResult>,
    consecutive_unreachable: u32,
    challenges: ChallengePool,
}

impl TrackedShard {
    fn new(challenges: ChallengePool) -> Self {
        Self {
            state: ShardAuditState::Unaudited,
            last_result: None,
            consecutive_unreachable: 0,
            challenges,
        }
    }

    fn is_due(&self, now: u64) -> bool {
        match self.state {
            ShardAuditState::Unaudited => true,
            ShardAuditState::Scheduled { due } => due <= now,
            _ => false,
        }
    }
}

struct WatchedFile {
    manifest: FileManifest,
    shards: BTreeMap<u16, TrackedShard>,
}

/// One due shard, with the token it will be challenged with.
struct DueShard {
    file_id: FileId,
    descriptor: ShardDescriptor,
    token: Option<ChallengeToken>,
}

/// Outcome of auditing one [`DueShard`].
struct Resolved {
    file_id: FileId,
    shard_index: u16,
    result: AuditResult,
    /// Fresh challenges when the audit downloaded the shard
    refill: Option<ChallengePool>,
}

/// Audits watched files and repairs what fails.
pub struct AuditEngine {
    ctx: Arc<EngineContext>,
    distributor: Arc<ShardDistributor>,
    files: Mutex<HashMap<FileId, WatchedFile>>,
}

impl AuditEngine {
    pub fn new(ctx: Arc<EngineContext>, distributor: Arc<ShardDistributor>) -> Self {
        Self {
            ctx,
            distributor,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Starts auditing a file. Re-watching replaces the manifest and resets
    /// every shard to `Unaudited`.
    ///
    /// `challenges[i]` holds the precomputed challenges for shard `i`. Shards
    /// without any are downloaded and checked at their first audit.
    pub fn watch(&self, manifest: FileManifest, mut challenges: Vec<ChallengePool>) {
        let shards = manifest
            .shards
            .iter()
            .map(|d| {
                let pool = challenges
                    .get_mut(d.shard_index as usize)
                    .map(std::mem::take)
                    .unwrap_or_default();
                (d.shard_index, TrackedShard::new(pool))
            })
            .collect();
        debug!(file_id = %manifest.file_id.short(), "watching file");
        self.files
            .lock()
            .insert(manifest.file_id, WatchedFile { manifest, shards });
    }

    pub fn unwatch(&self, file_id: &FileId) -> bool {
        self.files.lock().remove(file_id).is_some()
    }

    /// The latest manifest for a watched file, including repairs.
    pub fn manifest(&self, file_id: &FileId) -> Option<FileManifest> {
        self.files.lock().get(file_id).map(|f| f.manifest.clone())
    }

    pub fn shard_state(&self, file_id: &FileId, shard_index: u16) -> Option<ShardAuditState> {
        self.files
            .lock()
            .get(file_id)
            .and_then(|f| f.shards.get(&shard_index))
            .map(|s| s.state)
    }

    pub fn last_result(&self, file_id: &FileId, shard_index: u16) -> Option<AuditResult> {
        self.files
            .lock()
            .get(file_id)
            .and_then(|f| f.shards.get(&shard_index))
            .and_then(|s| s.last_result)
    }

    /// Unspent precomputed challenges for one shard.
    pub fn remaining_challenges(&self, file_id: &FileId, shard_index: u16) -> Option<usize> {
        self.files
            .lock()
            .get(file_id)
            .and_then(|f| f.shards.get(&shard_index))
            .map(|s| s.challenges.remaining())
    }

    pub fn watched_files(&self) -> usize {
        self.files.lock().len()
    }

    /// Runs one audit round at clock reading `now`.
    ///
    /// Every due shard is challenged in parallel. Results are applied, each
    /// shard is rescheduled `audit_interval_secs` later, and the shards that
    /// need it are repaired one file at a time.
    pub async fn tick(&self, now: u64) -> AuditReport {
        let span = debug_span!("audit_round", now);
        async move {
            let due = self.collect_due(now);
            let mut report = AuditReport {
                challenged: due.len(),
                ..Default::default()
            };
            if due.is_empty() {
                return report;
            }

            let mut challenges: FuturesUnordered<_> =
                due.into_iter().map(|shard| self.challenge(shard)).collect();
            let mut results = Vec::with_capacity(report.challenged);
            while let Some(resolved) = challenges.next().await {
                results.push(resolved);
            }
            drop(challenges);

            let metrics = &self.ctx.metrics;
            for resolved in &results {
                EngineMetrics::incr(&metrics.audits_total);
                match resolved.result {
                    AuditResult::Verified => {
                        report.verified += 1;
                        EngineMetrics::incr(&metrics.audits_passed);
                    }
                    AuditResult::Failed => {
                        report.failed += 1;
                        EngineMetrics::incr(&metrics.audits_failed);
                    }
                    AuditResult::Unreachable => {
                        report.unreachable += 1;
                        EngineMetrics::incr(&metrics.audits_unreachable);
                    }
                }
            }

            let to_repair = self.apply_results(now, results);
            for (file_id, shard_index) in to_repair {
                if self.repair(now, &file_id, shard_index).await {
                    report.repaired.push((file_id, shard_index));
                } else {
                    report.repair_failures += 1;
                }
            }

            info!(
                challenged = report.challenged,
                verified = report.verified,
                failed = report.failed,
                unreachable = report.unreachable,
                repaired = report.repaired.len(),
                "audit round complete"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Drives [`AuditEngine::tick`] every `audit_interval_secs` until
    /// `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Reputation evidence is aged by one interval after every round.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval_secs = self.ctx.config.audit_interval_secs.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs, "audit loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(self.ctx.clock.now()).await;
                    self.ctx.reputation.decay(interval_secs);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("audit loop stopped");
    }

    fn collect_due(&self, now: u64) -> Vec<DueShard> {
        let mut files = self.files.lock();
        let mut due = Vec::new();
        for (file_id, file) in files.iter_mut() {
            for descriptor in &file.manifest.shards {
                if let Some(tracked) = file.shards.get_mut(&descriptor.shard_index) {
                    if tracked.is_due(now) {
                        tracked.state = ShardAuditState::Challenged;
                        due.push(DueShard {
                            file_id: *file_id,
                            descriptor: descriptor.clone(),
                            token: tracked.challenges.take(),
                        });
                    }
                }
            }
        }
        due
    }

    /// Audits one holder and reports the outcome to the reputation book.
    async fn challenge(&self, due: DueShard) -> Resolved {
        let DueShard {
            file_id,
            descriptor,
            token,
        } = due;
        let (result, refill) = match self.ctx.registry.get_peer(&descriptor.assigned_peer_id).await {
            Ok(peer) => match token {
                Some(token) => (self.challenge_holder(&peer, &file_id, &descriptor, &token).await, None),
                None => self.download_and_refill(&peer, &file_id, &descriptor).await,
            },
            Err(e) => {
                debug!(shard = descriptor.shard_index, error = %e, "holder not in directory");
                (AuditResult::Unreachable, None)
            }
        };
        self.ctx
            .report(&descriptor.assigned_peer_id, result.outcome())
            .await;
        Resolved {
            file_id,
            shard_index: descriptor.shard_index,
            result,
            refill,
        }
    }

    async fn challenge_holder(
        &self,
        peer: &PeerRecord,
        file_id: &FileId,
        descriptor: &ShardDescriptor,
        token: &ChallengeToken,
    ) -> AuditResult {
        let challenge = token.challenge(*file_id, descriptor.shard_index);
        let answer = transport::with_timeout(
            self.ctx.config.audit_timeout(),
            peer,
            "audit_challenge",
            self.ctx.transport.audit_challenge(peer, &challenge),
        )
        .await;

        match answer {
            Ok(answer) => {
                if answer.proof != token.expected {
                    warn!(shard = descriptor.shard_index, peer = %peer.peer_id.short(), "wrong audit proof");
                    AuditResult::Failed
                } else if !answer.verify_signature(&challenge, &peer.public_key) {
                    warn!(shard = descriptor.shard_index, peer = %peer.peer_id.short(), "audit proof signature invalid");
                    AuditResult::Failed
                } else {
                    AuditResult::Verified
                }
            }
            Err(e) if e.is_transient() => {
                debug!(shard = descriptor.shard_index, peer = %peer.peer_id.short(), error = %e, "holder unreachable");
                AuditResult::Unreachable
            }
            Err(e) => {
                warn!(shard = descriptor.shard_index, peer = %peer.peer_id.short(), error = %e, "audit refused");
                AuditResult::Failed
            }
        }
    }

    /// Audits by downloading the whole shard, which also yields the bytes to
    /// precompute the next batch of challenges from.
    async fn download_and_refill(
        &self,
        peer: &PeerRecord,
        file_id: &FileId,
        descriptor: &ShardDescriptor,
    ) -> (AuditResult, Option<ChallengePool>) {
        let index = descriptor.shard_index;
        let fetched = transport::with_timeout(
            self.ctx.config.transfer_timeout(),
            peer,
            "get_shard",
            self.ctx.transport.get_shard(peer, file_id, index),
        )
        .await;

        match fetched {
            Ok(bytes) if integrity::verify_shard(&bytes, descriptor) => {
                debug!(shard = index, peer = %peer.peer_id.short(), "challenges refilled from holder");
                let pool = ChallengePool::generate(&bytes, self.ctx.config.audit_challenges_per_shard);
                (AuditResult::Verified, Some(pool))
            }
            Ok(_) => {
                warn!(shard = index, peer = %peer.peer_id.short(), "downloaded shard failed verification");
                EngineMetrics::incr(&self.ctx.metrics.integrity_violations);
                (AuditResult::Failed, None)
            }
            Err(e) if e.is_transient() => {
                debug!(shard = index, peer = %peer.peer_id.short(), error = %e, "holder unreachable");
                (AuditResult::Unreachable, None)
            }
            Err(e) => {
                warn!(shard = index, peer = %peer.peer_id.short(), error = %e, "holder could not produce shard");
                (AuditResult::Failed, None)
            }
        }
    }

    /// Records results, reschedules, and returns the shards needing repair.
    fn apply_results(&self, now: u64, results: Vec<Resolved>) -> Vec<(FileId, u16)> {
        let tolerance = self.ctx.config.unreachable_tolerance;
        let next_due = self.next_due(now);
        let mut files = self.files.lock();
        let mut to_repair = Vec::new();
        for Resolved {
            file_id,
            shard_index,
            result,
            refill,
        } in results
        {
            let Some(tracked) = files
                .get_mut(&file_id)
                .and_then(|f| f.shards.get_mut(&shard_index))
            else {
                continue;
            };
            debug!(shard = shard_index, state = ?result.state(), "challenge resolved");
            tracked.last_result = Some(result);
            tracked.state = ShardAuditState::Scheduled { due: next_due };
            if let Some(pool) = refill {
                tracked.challenges = pool;
            }
            let needs_repair = match result {
                AuditResult::Verified => {
                    tracked.consecutive_unreachable = 0;
                    false
                }
                AuditResult::Failed => {
                    tracked.consecutive_unreachable = 0;
                    true
                }
                AuditResult::Unreachable => {
                    tracked.consecutive_unreachable += 1;
                    tracked.consecutive_unreachable > tolerance
                }
            };
            if needs_repair {
                to_repair.push((file_id, shard_index));
            }
        }
        to_repair.sort();
        to_repair
    }

    fn next_due(&self, now: u64) -> u64 {
        now.saturating_add(self.ctx.config.audit_interval_secs)
    }

    /// Repairs one shard against the latest manifest; true on success.
    ///
    /// The new holder joins the regular schedule: its first challenge is due
    /// one interval after the repair.
    async fn repair(&self, now: u64, file_id: &FileId, shard_index: u16) -> bool {
        let Some(manifest) = self.manifest(file_id) else {
            return false;
        };
        match self.distributor.repair(&manifest, shard_index).await {
            Ok(repaired) => {
                EngineMetrics::incr(&self.ctx.metrics.repairs);
                let mut files = self.files.lock();
                if let Some(file) = files.get_mut(file_id) {
                    file.manifest = repaired.manifest;
                    let mut tracked = TrackedShard::new(repaired.challenges);
                    tracked.state = ShardAuditState::Scheduled {
                        due: self.next_due(now),
                    };
                    file.shards.insert(shard_index, tracked);
                }
                true
            }
            Err(e) => {
                EngineMetrics::incr(&self.ctx.metrics.repair_failures);
                warn!(file_id = %file_id.short(), shard = shard_index, error = %e, "repair failed");
                false
            }
        }
    }
}
