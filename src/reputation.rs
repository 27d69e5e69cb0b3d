//! Peer reputation.
//!
//! Scores are derived from weighted evidence rather than mutated in place. Each
//! peer accumulates positive and negative evidence, and its score is the
//! posterior mean of a Beta distribution:
//!
//! ```text
//! score = (PRIOR + positive) / (2 * PRIOR + positive + negative)
//! ```
//!
//! This keeps every score strictly inside `(0, 1)`. It gives diminishing
//! returns for successes, since each unit of positive evidence moves a
//! well-established peer less. Failures carry heavier weights than successes,
//! so trust is slow to earn and fast to lose. Because evidence only
//! accumulates by addition, the final score does not depend on the order in
//! which concurrent outcomes were recorded.

use crate::config;
use crate::registry::{PeerId, PeerRecord};
use crate::{Result, VaultError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Pseudo-observations on each side before any evidence is seen.
const PRIOR: f64 = 2.0;

/// Evidence half-life used by [`ReputationTracker::decay`], in seconds.
const EVIDENCE_HALF_LIFE_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Result of one interaction with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    SuccessfulTransfer,
    AuditPass,
    AuditFail,
    Timeout,
    IntegrityViolation,
}

impl Outcome {
    /// Positive and negative evidence contributed by this outcome.
    fn evidence(self) -> (f64, f64) {
        match self {
            Outcome::SuccessfulTransfer => (1.0, 0.0),
            Outcome::AuditPass => (1.0, 0.0),
            Outcome::Timeout => (0.0, 3.0),
            Outcome::AuditFail => (0.0, 6.0),
            Outcome::IntegrityViolation => (0.0, 12.0),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Outcome::SuccessfulTransfer | Outcome::AuditPass)
    }
}

/// Outcome counts for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub transfers: u64,
    pub audit_passes: u64,
    pub audit_failures: u64,
    pub timeouts: u64,
    pub integrity_violations: u64,
}

impl OutcomeCounters {
    fn record(&mut self, outcome: Outcome) {
        let slot = match outcome {
            Outcome::SuccessfulTransfer => &mut self.transfers,
            Outcome::AuditPass => &mut self.audit_passes,
            Outcome::AuditFail => &mut self.audit_failures,
            Outcome::Timeout => &mut self.timeouts,
            Outcome::IntegrityViolation => &mut self.integrity_violations,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PeerEvidence {
    positive: f64,
    negative: f64,
    counters: OutcomeCounters,
    /// Shards currently assigned; not persisted across restarts
    #[serde(skip)]
    load: u64,
}

impl PeerEvidence {
    fn score(&self) -> f64 {
        let score = (PRIOR + self.positive) / (2.0 * PRIOR + self.positive + self.negative);
        score.clamp(config::MIN_REPUTATION, config::MAX_REPUTATION)
    }
}

/// Snapshot format for [`ReputationTracker::save`].
#[derive(Serialize, Deserialize)]
struct ReputationData {
    version: u16,
    peers: Vec<(PeerId, PeerEvidence)>,
}

/// Thread-safe reputation book for all known peers.
#[derive(Debug, Default)]
pub struct ReputationTracker {
    peers: Mutex<HashMap<PeerId, PeerEvidence>>,
}

impl ReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome and returns the peer's new score.
    pub fn record_outcome(&self, peer_id: &PeerId, outcome: Outcome) -> f64 {
        let (positive, negative) = outcome.evidence();
        let mut peers = self.peers.lock();
        let entry = peers.entry(*peer_id).or_default();
        let before = entry.score();
        entry.positive += positive;
        entry.negative += negative;
        entry.counters.record(outcome);
        let after = entry.score();
        drop(peers);

        if outcome.is_success() {
            debug!(peer = %peer_id.short(), ?outcome, before, after, "reputation updated");
        } else {
            warn!(peer = %peer_id.short(), ?outcome, before, after, "reputation penalized");
        }
        after
    }

    /// Current score; unknown peers start neutral.
    pub fn score(&self, peer_id: &PeerId) -> f64 {
        self.peers
            .lock()
            .get(peer_id)
            .map(PeerEvidence::score)
            .unwrap_or(config::NEUTRAL_REPUTATION)
    }

    pub fn counters(&self, peer_id: &PeerId) -> OutcomeCounters {
        self.peers
            .lock()
            .get(peer_id)
            .map(|e| e.counters)
            .unwrap_or_default()
    }

    /// Shards currently assigned to a peer.
    pub fn load(&self, peer_id: &PeerId) -> u64 {
        self.peers.lock().get(peer_id).map(|e| e.load).unwrap_or(0)
    }

    pub fn assign(&self, peer_id: &PeerId) {
        self.peers.lock().entry(*peer_id).or_default().load += 1;
    }

    pub fn release(&self, peer_id: &PeerId) {
        if let Some(entry) = self.peers.lock().get_mut(peer_id) {
            entry.load = entry.load.saturating_sub(1);
        }
    }

    /// Filters candidates below `min_score` and orders the rest by score,
    /// highest first, breaking ties by lowest load and then by peer id.
    pub fn rank_peers(&self, candidates: &[PeerRecord], min_score: f64) -> Vec<PeerRecord> {
        let peers = self.peers.lock();
        let lookup = |id: &PeerId| {
            peers
                .get(id)
                .map(|e| (e.score(), e.load))
                .unwrap_or((config::NEUTRAL_REPUTATION, 0))
        };

        let mut ranked: Vec<(f64, u64, PeerRecord)> = candidates
            .iter()
            .map(|record| {
                let (score, load) = lookup(&record.peer_id);
                (score, load, record.clone())
            })
            .filter(|(score, _, _)| *score >= min_score)
            .collect();
        drop(peers);

        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.peer_id.cmp(&b.2.peer_id))
        });
        ranked.into_iter().map(|(_, _, record)| record).collect()
    }

    /// Ages all evidence by `elapsed_secs`, pulling scores back toward neutral.
    ///
    /// Decay scales both sides equally, so it never reorders the effect of
    /// outcomes recorded before it.
    pub fn decay(&self, elapsed_secs: u64) {
        let factor = 0.5f64.powf(elapsed_secs as f64 / EVIDENCE_HALF_LIFE_SECS);
        for entry in self.peers.lock().values_mut() {
            entry.positive *= factor;
            entry.negative *= factor;
        }
    }

    /// Persists evidence and counters (not load) to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut peers: Vec<(PeerId, PeerEvidence)> = self
            .peers
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));

        let data = ReputationData {
            version: config::REPUTATION_FORMAT_VERSION,
            peers,
        };

        let encoded = bincode::serialize(&data).map_err(|e| {
            VaultError::Serialization(format!("Failed to serialize reputation: {}", e))
        })?;

        if encoded.len() > config::MAX_REPUTATION_SNAPSHOT_BYTES {
            return Err(VaultError::InvalidInput(format!(
                "Serialized reputation size {} bytes exceeds maximum {} bytes",
                encoded.len(),
                config::MAX_REPUTATION_SNAPSHOT_BYTES
            )));
        }

        fs::write(path, encoded).map_err(|e| {
            VaultError::IO(format!(
                "Failed to write reputation to {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Restores a tracker written by [`ReputationTracker::save`].
    pub fn load_from(path: &Path) -> Result<Self> {
        let encoded = fs::read(path).map_err(|e| {
            VaultError::IO(format!(
                "Failed to read reputation from {}: {}",
                path.display(),
                e
            ))
        })?;

        if encoded.len() > config::MAX_REPUTATION_SNAPSHOT_BYTES {
            return Err(VaultError::InvalidInput(format!(
                "Reputation file size {} bytes exceeds maximum {} bytes",
                encoded.len(),
                config::MAX_REPUTATION_SNAPSHOT_BYTES
            )));
        }

        let data: ReputationData = bincode::deserialize(&encoded).map_err(|e| {
            VaultError::Serialization(format!("Failed to deserialize reputation: {}", e))
        })?;

        if data.version != config::REPUTATION_FORMAT_VERSION {
            return Err(VaultError::InvalidInput(format!(
                "Reputation format version {} is not compatible with current version {}",
                data.version,
                config::REPUTATION_FORMAT_VERSION
            )));
        }

        for (peer_id, evidence) in &data.peers {
            let valid = |v: f64| v.is_finite() && v >= 0.0;
            if !valid(evidence.positive) || !valid(evidence.negative) {
                return Err(VaultError::InvalidInput(format!(
                    "Corrupt evidence for peer {}",
                    peer_id.short()
                )));
            }
        }

        Ok(Self {
            peers: Mutex::new(data.peers.into_iter().collect()),
        })
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
