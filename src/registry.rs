//! Coordinator boundary: peer directory and manifest lookup.
//!
//! The engine treats the coordinator purely as a directory. It never sends it
//! plaintext, shard bytes or keys; only peer records and manifests cross this
//! boundary. [`InMemoryRegistry`] is a complete in-process implementation used
//! by the simulator and the test suite.

use crate::clock::Clock;
use crate::config;
use crate::integrity::{self, domain_tags, Digest};
use crate::manifest::{FileId, FileManifest};
use crate::{Result, VaultError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Peer identifier: tagged SHA-256 of the peer's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Digest);

impl PeerId {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        PeerId(integrity::hash_tagged(domain_tags::PEER_ID, &[public_key]))
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0.short())
    }
}

/// Liveness as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Online,
    /// Silent for longer than the heartbeat timeout; kept for its history
    Stale,
}

/// Directory entry for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Ed25519 verifying key
    pub public_key: [u8; 32],
    pub reputation_score: f64,
    pub available_storage: u64,
    /// Unix seconds
    pub last_seen: u64,
    pub address: String,
    pub status: PeerStatus,
}

/// Changes reported back to the coordinator after an interaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerUpdate {
    pub reputation_score: Option<f64>,
    pub seen_at: Option<u64>,
    pub available_storage: Option<u64>,
}

/// The coordinator as consumed by the engine.
#[async_trait]
pub trait PeerRegistry: Send + Sync {
    /// Adds a peer (or refreshes an existing one) and returns its id.
    async fn register_peer(
        &self,
        public_key: [u8; 32],
        address: String,
        storage_capacity: u64,
    ) -> Result<PeerId>;

    /// Online peers whose score is at least `min_reputation`.
    async fn list_peers(&self, min_reputation: f64) -> Result<Vec<PeerRecord>>;

    async fn get_peer(&self, peer_id: &PeerId) -> Result<PeerRecord>;

    async fn update_peer(&self, peer_id: &PeerId, update: PeerUpdate) -> Result<()>;

    /// Liveness ping from a peer.
    async fn heartbeat(&self, peer_id: &PeerId, available_storage: u64) -> Result<()>;

    /// Stores or replaces a manifest. Replacements may only move assignment
    /// versions forward.
    async fn publish_manifest(&self, manifest: &FileManifest) -> Result<()>;

    async fn lookup_manifest(&self, file_id: &FileId) -> Result<FileManifest>;
}

/// In-process coordinator.
///
/// Manifests are held in their persisted binary form, keyed by file id, and
/// decoded (and re-validated) on every lookup.
pub struct InMemoryRegistry {
    peers: RwLock<BTreeMap<PeerId, PeerRecord>>,
    manifests: RwLock<HashMap<FileId, Vec<u8>>>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout_secs: u64,
}

impl InMemoryRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_heartbeat_timeout(clock, config::DEFAULT_HEARTBEAT_TIMEOUT_SECS)
    }

    pub fn with_heartbeat_timeout(clock: Arc<dyn Clock>, heartbeat_timeout_secs: u64) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            manifests: RwLock::new(HashMap::new()),
            clock,
            heartbeat_timeout_secs,
        }
    }

    fn status_at(&self, record: &PeerRecord, now: u64) -> PeerStatus {
        if now.saturating_sub(record.last_seen) > self.heartbeat_timeout_secs {
            PeerStatus::Stale
        } else {
            PeerStatus::Online
        }
    }

    /// All peers, stale ones included.
    pub fn all_peers(&self) -> Vec<PeerRecord> {
        let now = self.clock.now();
        self.peers
            .read()
            .values()
            .map(|r| PeerRecord {
                status: self.status_at(r, now),
                ..r.clone()
            })
            .collect()
    }

    pub fn manifest_count(&self) -> usize {
        self.manifests.read().len()
    }
}

#[async_trait]
impl PeerRegistry for InMemoryRegistry {
    async fn register_peer(
        &self,
        public_key: [u8; 32],
        address: String,
        storage_capacity: u64,
    ) -> Result<PeerId> {
        let peer_id = PeerId::from_public_key(&public_key);
        let now = self.clock.now();
        let mut peers = self.peers.write();
        match peers.get_mut(&peer_id) {
            Some(existing) => {
                existing.address = address;
                existing.available_storage = storage_capacity;
                existing.last_seen = now;
                existing.status = PeerStatus::Online;
                debug!(peer = %peer_id.short(), "peer re-registered");
            }
            None => {
                peers.insert(
                    peer_id,
                    PeerRecord {
                        peer_id,
                        public_key,
                        reputation_score: config::NEUTRAL_REPUTATION,
                        available_storage: storage_capacity,
                        last_seen: now,
                        address,
                        status: PeerStatus::Online,
                    },
                );
                info!(peer = %peer_id.short(), "peer registered");
            }
        }
        Ok(peer_id)
    }

    async fn list_peers(&self, min_reputation: f64) -> Result<Vec<PeerRecord>> {
        let now = self.clock.now();
        Ok(self
            .peers
            .read()
            .values()
            .filter(|r| self.status_at(r, now) == PeerStatus::Online)
            .filter(|r| r.reputation_score >= min_reputation)
            .cloned()
            .collect())
    }

    async fn get_peer(&self, peer_id: &PeerId) -> Result<PeerRecord> {
        let now = self.clock.now();
        self.peers
            .read()
            .get(peer_id)
            .map(|r| PeerRecord {
                status: self.status_at(r, now),
                ..r.clone()
            })
            .ok_or_else(|| VaultError::PeerNotFound {
                peer_id: peer_id.to_string(),
            })
    }

    async fn update_peer(&self, peer_id: &PeerId, update: PeerUpdate) -> Result<()> {
        let mut peers = self.peers.write();
        let record = peers.get_mut(peer_id).ok_or_else(|| VaultError::PeerNotFound {
            peer_id: peer_id.to_string(),
        })?;
        if let Some(score) = update.reputation_score {
            record.reputation_score = score.clamp(config::MIN_REPUTATION, config::MAX_REPUTATION);
        }
        if let Some(seen_at) = update.seen_at {
            record.last_seen = record.last_seen.max(seen_at);
        }
        if let Some(storage) = update.available_storage {
            record.available_storage = storage;
        }
        Ok(())
    }

    async fn heartbeat(&self, peer_id: &PeerId, available_storage: u64) -> Result<()> {
        let now = self.clock.now();
        self.update_peer(
            peer_id,
            PeerUpdate {
                seen_at: Some(now),
                available_storage: Some(available_storage),
                ..Default::default()
            },
        )
        .await
    }

    async fn publish_manifest(&self, manifest: &FileManifest) -> Result<()> {
        let bytes = manifest.to_bytes()?;
        let mut manifests = self.manifests.write();
        let digest = integrity::manifest_digest(manifest)?;
        if let Some(existing) = manifests.get(&manifest.file_id) {
            let existing = FileManifest::from_bytes(existing)?;
            if integrity::manifest_digest(&existing)? == digest {
                debug!(file_id = %manifest.file_id.short(), "manifest unchanged");
                return Ok(());
            }
            check_successor(&existing, manifest)?;
        }
        manifests.insert(manifest.file_id, bytes);
        debug!(file_id = %manifest.file_id.short(), digest = %digest.short(), "manifest published");
        Ok(())
    }

    async fn lookup_manifest(&self, file_id: &FileId) -> Result<FileManifest> {
        let bytes = self
            .manifests
            .read()
            .get(file_id)
            .cloned()
            .ok_or_else(|| VaultError::ManifestNotFound {
                file_id: file_id.to_string(),
            })?;
        let manifest = FileManifest::from_bytes(&bytes)?;
        if &manifest.file_id != file_id {
            return Err(VaultError::InvalidManifest {
                reason: "stored manifest does not match its address".to_string(),
            });
        }
        Ok(manifest)
    }
}

/// A republished manifest must describe the same encoding and may only move
/// assignment versions forward. Moving a shard to another peer takes a
/// strictly newer version, so two repairs racing from the same manifest
/// cannot both be accepted.
fn check_successor(existing: &FileManifest, next: &FileManifest) -> Result<()> {
    if existing.total_shards != next.total_shards
        || existing.required_shards != next.required_shards
        || existing.shard_size != next.shard_size
        || existing.original_length != next.original_length
        || existing.encryption != next.encryption
    {
        return Err(VaultError::InvalidManifest {
            reason: "republished manifest changes encoding parameters".to_string(),
        });
    }
    for old in &existing.shards {
        let Some(new) = next.descriptor(old.shard_index) else {
            return Err(VaultError::InvalidManifest {
                reason: format!("shard {} missing from republished manifest", old.shard_index),
            });
        };
        if new.content_digest != old.content_digest {
            return Err(VaultError::InvalidManifest {
                reason: format!("shard {} digest changed", old.shard_index),
            });
        }
        if new.assignment_version < old.assignment_version {
            return Err(VaultError::InvalidManifest {
                reason: format!(
                    "stale assignment for shard {}: version {} < {}",
                    old.shard_index, new.assignment_version, old.assignment_version
                ),
            });
        }
        if new.assigned_peer_id != old.assigned_peer_id
            && new.assignment_version == old.assignment_version
        {
            return Err(VaultError::InvalidManifest {
                reason: format!(
                    "shard {} reassigned without a new version (still {})",
                    old.shard_index, old.assignment_version
                ),
            });
        }
    }
    Ok(())
}
