//! Shard placement and single-shard repair.
//!
//! Placement ranks the pool through the reputation book and assigns shard
//! `i` to the `i`-th ranked peer. Uploads run in parallel; a shard whose peer
//! refuses it or stays silent moves to the next unclaimed peer in the ranking,
//! a bounded number of times. Claims go through a per-file [`ClaimBoard`], so
//! no peer ever receives two shards of one file. A file is published only
//! when every shard has been accepted; otherwise whatever was stored is
//! deleted again and the call fails with [`VaultError::PlacementFailure`].

use crate::api::EngineContext;
use crate::audit::ChallengePool;
use crate::erasure::{self, Shard};
use crate::integrity::{self, Digest};
use crate::manifest::{EncryptionParams, FileId, FileManifest, ShardDescriptor};
use crate::metrics::EngineMetrics;
use crate::registry::{PeerId, PeerRecord, PeerUpdate};
use crate::reputation::Outcome;
use crate::retrieval::RetrievalEngine;
use crate::transport::{PutAck, PutShard};
use crate::{Result, VaultError};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Everything placement needs for one encoded file.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub file_id: FileId,
    pub required_shards: u16,
    pub original_length: u64,
    pub encryption: EncryptionParams,
    /// All `n` shards, in index order
    pub shards: Vec<Shard>,
}

/// A shard moved to a new holder.
#[derive(Debug, Clone)]
pub struct Repaired {
    /// The published manifest, with the new holder recorded
    pub manifest: FileManifest,
    /// Challenges precomputed from the regenerated shard
    pub challenges: ChallengePool,
}

/// Ranked candidates for one file, with the peers already claimed.
///
/// Claimed peers stay claimed even if their upload fails, so a peer that
/// refused one shard is not offered another shard of the same file.
struct ClaimBoard {
    ranked: Vec<PeerRecord>,
    claimed: HashSet<PeerId>,
}

impl ClaimBoard {
    fn new(ranked: Vec<PeerRecord>, excluded: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            ranked,
            claimed: excluded.into_iter().collect(),
        }
    }

    /// Highest-ranked peer nobody has claimed yet.
    fn claim(&mut self) -> Option<PeerRecord> {
        let next = self
            .ranked
            .iter()
            .find(|p| !self.claimed.contains(&p.peer_id))?
            .clone();
        self.claimed.insert(next.peer_id);
        Some(next)
    }

    fn unclaimed(&self) -> usize {
        self.ranked
            .iter()
            .filter(|p| !self.claimed.contains(&p.peer_id))
            .count()
    }
}

/// Places shards on peers and moves them when holders fail.
pub struct ShardDistributor {
    ctx: Arc<EngineContext>,
}

impl ShardDistributor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Places every shard of `request` on a distinct peer from `peer_pool`
    /// and publishes the resulting manifest.
    ///
    /// # Errors
    ///
    /// [`VaultError::PlacementFailure`] if fewer than `n` peers in the pool
    /// pass the reputation threshold, or if some shard is refused by every
    /// peer it is offered to. Nothing is published in either case.
    pub async fn place(
        &self,
        request: PlacementRequest,
        peer_pool: &[PeerRecord],
    ) -> Result<FileManifest> {
        let total = request.shards.len();
        let span = debug_span!("place", file_id = %request.file_id.short(), n = total);
        async move {
            let ranked = self
                .ctx
                .reputation
                .rank_peers(peer_pool, self.ctx.config.min_placement_reputation);
            if ranked.len() < total {
                warn!(eligible = ranked.len(), needed = total, "not enough eligible peers");
                return Err(VaultError::PlacementFailure {
                    reason: format!(
                        "{} eligible peers for {} shards",
                        ranked.len(),
                        total
                    ),
                });
            }

            let board = Mutex::new(ClaimBoard::new(ranked, []));
            let mut initial = Vec::with_capacity(total);
            for _ in 0..total {
                // Enough eligible peers was checked above
                match board.lock().claim() {
                    Some(peer) => initial.push(peer),
                    None => {
                        return Err(VaultError::PlacementFailure {
                            reason: "ran out of eligible peers".to_string(),
                        })
                    }
                }
            }

            let mut uploads: FuturesUnordered<_> = request
                .shards
                .iter()
                .zip(initial)
                .map(|(shard, peer)| self.upload_with_reassignment(&request.file_id, shard, peer, &board))
                .collect();

            let mut placed: Vec<(u16, Digest, PeerRecord)> = Vec::with_capacity(total);
            let mut failures = Vec::new();
            while let Some(result) = uploads.next().await {
                match result {
                    Ok(entry) => placed.push(entry),
                    Err(e) => failures.push(e),
                }
            }
            drop(uploads);

            if let Some(first) = failures.into_iter().next() {
                self.roll_back(&request.file_id, &placed).await;
                return Err(match first {
                    e @ VaultError::PlacementFailure { .. } => e,
                    other => VaultError::PlacementFailure {
                        reason: other.to_string(),
                    },
                });
            }

            placed.sort_by_key(|(index, _, _)| *index);
            let shard_size = request.shards.first().map(|s| s.bytes.len()).unwrap_or(1) as u64;
            let manifest = FileManifest {
                file_id: request.file_id,
                total_shards: total as u16,
                required_shards: request.required_shards,
                shard_size,
                original_length: request.original_length,
                encryption: request.encryption,
                created_at: self.ctx.clock.now(),
                shards: placed
                    .iter()
                    .map(|(index, content_digest, peer)| ShardDescriptor {
                        shard_index: *index,
                        content_digest: *content_digest,
                        assigned_peer_id: peer.peer_id,
                        assignment_version: 0,
                    })
                    .collect(),
            };

            if let Some(reason) = integrity::manifest_problem(&manifest) {
                self.roll_back(&request.file_id, &placed).await;
                return Err(VaultError::InvalidManifest { reason });
            }
            if let Err(e) = self.ctx.registry.publish_manifest(&manifest).await {
                self.roll_back(&request.file_id, &placed).await;
                return Err(e);
            }

            info!(redundancy = manifest.redundancy_factor(), "file placed");
            Ok(manifest)
        }
        .instrument(span)
        .await
    }

    /// Uploads one shard, moving to the next unclaimed peer on failure.
    async fn upload_with_reassignment(
        &self,
        file_id: &FileId,
        shard: &Shard,
        first: PeerRecord,
        board: &Mutex<ClaimBoard>,
    ) -> Result<(u16, Digest, PeerRecord)> {
        let content_digest = integrity::digest(&shard.bytes);
        let request = PutShard {
            file_id: *file_id,
            shard_index: shard.index,
            bytes: shard.bytes.clone(),
            content_digest,
        };

        let mut peer = first;
        let attempts = self.ctx.config.placement_retries + 1;
        for attempt in 0..attempts {
            match self.put(&peer, request.clone()).await {
                Ok(()) => return Ok((shard.index, content_digest, peer)),
                Err(e) => {
                    debug!(shard = shard.index, peer = %peer.peer_id.short(), attempt, error = %e, "upload failed");
                }
            }
            if attempt + 1 == attempts {
                break;
            }
            match board.lock().claim() {
                Some(next) => peer = next,
                None => break,
            }
        }

        Err(VaultError::PlacementFailure {
            reason: format!("shard {} refused by every candidate", shard.index),
        })
    }

    /// Stores one shard on one peer and does the bookkeeping for success.
    async fn put(&self, peer: &PeerRecord, request: PutShard) -> Result<()> {
        let transport = &self.ctx.transport;
        let size = request.bytes.len() as u64;
        let ack: PutAck = self
            .ctx
            .transfer(peer, "put_shard", move || transport.put_shard(peer, request.clone()))
            .await?;

        self.ctx.reputation.assign(&peer.peer_id);
        self.ctx.report(&peer.peer_id, Outcome::SuccessfulTransfer).await;
        let update = PeerUpdate {
            available_storage: Some(ack.available_storage),
            ..Default::default()
        };
        if let Err(e) = self.ctx.registry.update_peer(&peer.peer_id, update).await {
            debug!(peer = %peer.peer_id.short(), error = %e, "storage update not recorded");
        }
        EngineMetrics::incr(&self.ctx.metrics.shards_uploaded);
        EngineMetrics::add(&self.ctx.metrics.bytes_uploaded, size);
        Ok(())
    }

    /// Best-effort removal of shards stored by a failed placement.
    async fn roll_back(&self, file_id: &FileId, placed: &[(u16, Digest, PeerRecord)]) {
        warn!(file_id = %file_id.short(), stored = placed.len(), "rolling back placement");
        let timeout = self.ctx.config.transfer_timeout();
        let mut deletions: FuturesUnordered<_> = placed
            .iter()
            .map(|(index, _, peer)| async move {
                let result = crate::transport::with_timeout(
                    timeout,
                    peer,
                    "delete_shard",
                    self.ctx.transport.delete_shard(peer, file_id, *index),
                )
                .await;
                self.ctx.reputation.release(&peer.peer_id);
                (index, peer, result)
            })
            .collect();
        while let Some((index, peer, result)) = deletions.next().await {
            if let Err(e) = result {
                debug!(shard = index, peer = %peer.peer_id.short(), error = %e, "rollback delete failed");
            }
        }
    }

    /// Moves shard `failed_index` off its current holder.
    ///
    /// The shard is regenerated from `k` verified shards held by the other
    /// peers, checked against the recorded digest and stored on the best
    /// ranked peer that holds no shard of this file. The returned manifest
    /// has a new holder and a bumped `assignment_version` for that shard and
    /// has already been published.
    pub async fn repair(&self, manifest: &FileManifest, failed_index: u16) -> Result<Repaired> {
        let span = debug_span!("repair", file_id = %manifest.file_id.short(), shard = failed_index);
        async move {
            let descriptor = manifest.descriptor(failed_index).cloned().ok_or_else(|| {
                VaultError::InvalidInput(format!("manifest has no shard {failed_index}"))
            })?;
            let failed_peer = descriptor.assigned_peer_id;

            let shard = self.regenerate(manifest, &descriptor).await?;

            let candidates = self
                .ctx
                .registry
                .list_peers(self.ctx.config.min_placement_reputation)
                .await?;
            let ranked = self
                .ctx
                .reputation
                .rank_peers(&candidates, self.ctx.config.min_placement_reputation);
            let mut board = ClaimBoard::new(ranked, manifest.holders().copied());
            if board.unclaimed() == 0 {
                return Err(VaultError::PlacementFailure {
                    reason: "no eligible peer outside the current holders".to_string(),
                });
            }

            let challenges =
                ChallengePool::generate(&shard.bytes, self.ctx.config.audit_challenges_per_shard);
            let request = PutShard {
                file_id: manifest.file_id,
                shard_index: failed_index,
                bytes: shard.bytes,
                content_digest: descriptor.content_digest,
            };
            let mut new_holder = None;
            for _ in 0..=self.ctx.config.placement_retries {
                let Some(peer) = board.claim() else { break };
                match self.put(&peer, request.clone()).await {
                    Ok(()) => {
                        new_holder = Some(peer);
                        break;
                    }
                    Err(e) => debug!(peer = %peer.peer_id.short(), error = %e, "repair upload failed"),
                }
            }
            let new_holder = new_holder.ok_or_else(|| VaultError::PlacementFailure {
                reason: format!("no peer accepted repaired shard {failed_index}"),
            })?;

            let mut updated = manifest.clone();
            if let Some(entry) = updated.descriptor_mut(failed_index) {
                entry.assigned_peer_id = new_holder.peer_id;
                entry.assignment_version += 1;
            }
            if let Err(e) = self.ctx.registry.publish_manifest(&updated).await {
                let _ = crate::transport::with_timeout(
                    self.ctx.config.transfer_timeout(),
                    &new_holder,
                    "delete_shard",
                    self.ctx.transport.delete_shard(&new_holder, &manifest.file_id, failed_index),
                )
                .await;
                self.ctx.reputation.release(&new_holder.peer_id);
                return Err(e);
            }
            self.ctx.reputation.release(&failed_peer);
            self.discard_from(failed_peer, manifest.file_id, failed_index);

            info!(
                from = %failed_peer.short(),
                to = %new_holder.peer_id.short(),
                "shard re-placed"
            );
            Ok(Repaired {
                manifest: updated,
                challenges,
            })
        }
        .instrument(span)
        .await
    }

    /// Rebuilds one shard from the rest of the file.
    async fn regenerate(&self, manifest: &FileManifest, descriptor: &ShardDescriptor) -> Result<Shard> {
        let retrieval = RetrievalEngine::new(self.ctx.clone());
        let shards = retrieval
            .collect_shards(manifest, &[descriptor.shard_index])
            .await?;
        let params = manifest.codec_params();
        let ciphertext = erasure::decode(&shards, &params)?;
        let shard = erasure::encode(&ciphertext, params.required, params.total)?
            .into_iter()
            .nth(descriptor.shard_index as usize)
            .ok_or_else(|| VaultError::InvalidInput(format!(
                "shard index {} outside encoding",
                descriptor.shard_index
            )))?;
        if !integrity::verify_shard(&shard.bytes, descriptor) {
            return Err(VaultError::InvalidManifest {
                reason: format!(
                    "regenerated shard {} does not match its recorded digest",
                    descriptor.shard_index
                ),
            });
        }
        Ok(shard)
    }

    /// Asks the old holder to drop its copy, without waiting for it.
    fn discard_from(&self, peer_id: PeerId, file_id: FileId, shard_index: u16) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let Ok(peer) = ctx.registry.get_peer(&peer_id).await else {
                return;
            };
            let result = crate::transport::with_timeout(
                ctx.config.transfer_timeout(),
                &peer,
                "delete_shard",
                ctx.transport.delete_shard(&peer, &file_id, shard_index),
            )
            .await;
            if let Err(e) = result {
                debug!(peer = %peer_id.short(), error = %e, "old holder kept its copy");
            }
        });
    }
}
