//! Centralized configuration for the shardvault storage engine.
//!
//! This module contains constants and default parameters used throughout the
//! engine, plus the [`EngineConfig`] struct that bundles the tunable ones.

use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// --- Erasure Coding Parameters ---

/// Default number of shards produced per file (n).
pub const DEFAULT_TOTAL_SHARDS: usize = 20;

/// Default number of shards needed to reconstruct a file (k).
pub const DEFAULT_REQUIRED_SHARDS: usize = 8;

/// Upper bound on n imposed by Reed-Solomon over GF(2^8).
pub const MAX_TOTAL_SHARDS: usize = 256;

// --- Cryptographic Sizes ---

/// Length of a derived encryption key (AES-256).
pub const KEY_LEN: usize = 32;

/// Length of the random KDF salt.
pub const SALT_LEN: usize = 16;

/// Length of the AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Length of the detached AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Length of every digest produced by the integrity index (SHA-256).
pub const DIGEST_LEN: usize = 32;

/// Length of the random nonce in an audit challenge.
pub const AUDIT_NONCE_LEN: usize = 32;

// --- Key Derivation Defaults (Argon2id) ---

/// Default Argon2 time cost.
pub const DEFAULT_KDF_ITERATIONS: u32 = 3;

/// Default Argon2 memory cost in KiB (64 MiB).
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 64 * 1024;

/// Default Argon2 lane count.
pub const DEFAULT_KDF_PARALLELISM: u32 = 4;

// --- Reputation ---

/// Lower bound of every reputation score.
pub const MIN_REPUTATION: f64 = 0.0;

/// Upper bound of every reputation score.
pub const MAX_REPUTATION: f64 = 1.0;

/// Score of a peer with no history.
pub const NEUTRAL_REPUTATION: f64 = 0.5;

/// Peers scoring below this are never chosen for placement.
pub const DEFAULT_MIN_PLACEMENT_REPUTATION: f64 = 0.3;

// --- Network and Scheduling ---

/// Per-request timeout for shard transfers (milliseconds).
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 30_000;

/// Per-request timeout for audit challenges (milliseconds).
pub const DEFAULT_AUDIT_TIMEOUT_MS: u64 = 30_000;

/// Attempts per shard transfer before giving up on a peer.
pub const DEFAULT_TRANSFER_RETRIES: u32 = 3;

/// Base backoff between transfer attempts (milliseconds); doubles per attempt.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Extra peers tried per shard when the assigned peer refuses it.
pub const DEFAULT_PLACEMENT_RETRIES: u32 = 3;

/// Delay before the single retry of a failed retrieval (milliseconds).
pub const DEFAULT_RETRIEVAL_RETRY_DELAY_MS: u64 = 1_000;

/// Seconds between audits of the same shard.
pub const DEFAULT_AUDIT_INTERVAL_SECS: u64 = 300;

/// Challenges precomputed per shard while its bytes are at hand. When a
/// shard's pool runs dry the next audit downloads the shard and refills it.
pub const DEFAULT_AUDIT_CHALLENGES_PER_SHARD: usize = 16;

/// Consecutive unreachable audits tolerated before a shard is repaired.
pub const DEFAULT_UNREACHABLE_TOLERANCE: u32 = 3;

/// Seconds of silence after which a peer is marked stale.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;

// --- Persisted Formats ---

/// Current manifest format version
pub const MANIFEST_FORMAT_VERSION: u16 = 1;

/// Maximum size of a serialized manifest (4 MiB)
pub const MAX_MANIFEST_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// Current reputation snapshot format version
pub const REPUTATION_FORMAT_VERSION: u16 = 1;

/// Maximum size for serialized reputation snapshots (100 MB)
pub const MAX_REPUTATION_SNAPSHOT_BYTES: usize = 100 * 1024 * 1024;

// --- Test-related Constants ---

/// A fixed random seed used in tests to ensure deterministic behavior.
pub const TEST_RANDOM_SEED: u64 = 42;

/// Tunable engine parameters.
///
/// Durations are stored as integer milliseconds/seconds so the struct
/// serializes cleanly; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shards produced per file (n)
    pub total_shards: usize,
    /// Shards needed to reconstruct (k)
    pub required_shards: usize,
    /// Argon2 time cost
    pub kdf_iterations: u32,
    /// Argon2 memory cost in KiB
    pub kdf_memory_kib: u32,
    /// Argon2 lanes
    pub kdf_parallelism: u32,
    /// Minimum reputation for a peer to receive shards
    pub min_placement_reputation: f64,
    pub transfer_timeout_ms: u64,
    pub audit_timeout_ms: u64,
    pub transfer_retries: u32,
    pub retry_backoff_ms: u64,
    pub placement_retries: u32,
    pub retrieval_retry_delay_ms: u64,
    pub audit_interval_secs: u64,
    /// Precomputed challenges kept per shard
    pub audit_challenges_per_shard: usize,
    pub unreachable_tolerance: u32,
    pub heartbeat_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            total_shards: DEFAULT_TOTAL_SHARDS,
            required_shards: DEFAULT_REQUIRED_SHARDS,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            kdf_memory_kib: DEFAULT_KDF_MEMORY_KIB,
            kdf_parallelism: DEFAULT_KDF_PARALLELISM,
            min_placement_reputation: DEFAULT_MIN_PLACEMENT_REPUTATION,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            audit_timeout_ms: DEFAULT_AUDIT_TIMEOUT_MS,
            transfer_retries: DEFAULT_TRANSFER_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            placement_retries: DEFAULT_PLACEMENT_RETRIES,
            retrieval_retry_delay_ms: DEFAULT_RETRIEVAL_RETRY_DELAY_MS,
            audit_interval_secs: DEFAULT_AUDIT_INTERVAL_SECS,
            audit_challenges_per_shard: DEFAULT_AUDIT_CHALLENGES_PER_SHARD,
            unreachable_tolerance: DEFAULT_UNREACHABLE_TOLERANCE,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    /// Checks that the parameters describe a usable engine.
    pub fn validate(&self) -> Result<()> {
        validate_erasure_params(self.required_shards, self.total_shards)?;
        if self.kdf_iterations == 0 || self.kdf_parallelism == 0 {
            return Err(VaultError::InvalidInput(
                "KDF iterations and parallelism must be positive".to_string(),
            ));
        }
        if !(MIN_REPUTATION..=MAX_REPUTATION).contains(&self.min_placement_reputation) {
            return Err(VaultError::InvalidInput(format!(
                "min_placement_reputation {} outside [{MIN_REPUTATION}, {MAX_REPUTATION}]",
                self.min_placement_reputation
            )));
        }
        if self.transfer_retries == 0 {
            return Err(VaultError::InvalidInput(
                "transfer_retries must be at least 1".to_string(),
            ));
        }
        if self.audit_challenges_per_shard == 0 {
            return Err(VaultError::InvalidInput(
                "audit_challenges_per_shard must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_millis(self.audit_timeout_ms)
    }

    /// Backoff before attempt `attempt` (0-based); doubles each time.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    pub fn retrieval_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retrieval_retry_delay_ms)
    }

    /// KDF parameters for a new upload.
    pub fn kdf_params(&self) -> crate::manifest::KdfParams {
        crate::manifest::KdfParams {
            iterations: self.kdf_iterations,
            memory_kib: self.kdf_memory_kib,
            parallelism: self.kdf_parallelism,
        }
    }
}

/// Validates a (k, n) pair: `1 <= k < n <= MAX_TOTAL_SHARDS`.
pub fn validate_erasure_params(required: usize, total: usize) -> Result<()> {
    if required == 0 || required >= total || total > MAX_TOTAL_SHARDS {
        return Err(VaultError::InvalidErasureParams { required, total });
    }
    Ok(())
}
