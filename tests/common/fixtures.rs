//! Test fixtures and scenario configuration.
//!
//! This module provides the TestConfig struct for declarative test setup
//! and the TestNetwork struct containing all components needed for a test:
//! a manual clock, an in-memory coordinator, in-memory peers and an engine.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use shardvault::{
    api::{EngineContext, StorageEngine},
    clock::ManualClock,
    config::{self, EngineConfig},
    manifest::FileManifest,
    peer::{MemoryNetwork, MemoryPeer, PeerHandle},
    registry::{InMemoryRegistry, PeerId, PeerRegistry},
};
use std::sync::Arc;

/// Clock reading every test network starts at.
pub const START_TIME: u64 = 1_700_000_000;

/// Complete test scenario configuration.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Number of peers registered before the engine starts
    pub peers: usize,
    /// k
    pub required: usize,
    /// n
    pub total: usize,
    /// Storage capacity of each peer
    pub capacity: u64,
    /// Consecutive unreachable audits tolerated before repair
    pub unreachable_tolerance: u32,
    /// Precomputed audit challenges per shard
    pub audit_challenges: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            peers: 6,
            required: 2,
            total: 4,
            capacity: 1 << 20,
            unreachable_tolerance: 2,
            audit_challenges: config::DEFAULT_AUDIT_CHALLENGES_PER_SHARD,
        }
    }
}

impl TestConfig {
    /// Creates a config with a specific peer count
    pub fn with_peers(peers: usize) -> Self {
        Self {
            peers,
            ..Default::default()
        }
    }

    /// Creates a config with specific redundancy parameters and enough peers
    pub fn with_redundancy(required: usize, total: usize) -> Self {
        Self {
            required,
            total,
            peers: total + 2,
            ..Default::default()
        }
    }

    /// Engine parameters tuned for tests: cheap KDF and short timeouts.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            total_shards: self.total,
            required_shards: self.required,
            kdf_iterations: 1,
            kdf_memory_kib: 64,
            kdf_parallelism: 1,
            transfer_timeout_ms: 1_000,
            audit_timeout_ms: 1_000,
            transfer_retries: 2,
            retry_backoff_ms: 10,
            placement_retries: 3,
            retrieval_retry_delay_ms: 100,
            audit_interval_secs: config::DEFAULT_AUDIT_INTERVAL_SECS,
            unreachable_tolerance: self.unreachable_tolerance,
            audit_challenges_per_shard: self.audit_challenges,
            // Tests move the clock in large steps; keep peers online
            heartbeat_timeout_secs: 10 * 365 * 24 * 3600,
            ..Default::default()
        }
    }
}

/// Deterministic identity for the `i`-th test peer.
pub fn peer_key(i: usize) -> SigningKey {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
    SigningKey::from_bytes(&seed)
}

/// Generate deterministic test data of the given size
pub fn test_data(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}

/// Complete test setup ready for assertions.
pub struct TestNetwork {
    pub config: TestConfig,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<InMemoryRegistry>,
    pub network: Arc<MemoryNetwork>,
    pub peers: Vec<(PeerId, PeerHandle)>,
    pub engine: StorageEngine,
}

impl TestNetwork {
    /// Starts `config.peers` peers, registers them and builds an engine.
    pub async fn new(config: TestConfig) -> Self {
        let engine_config = config.engine_config();
        let clock = Arc::new(ManualClock::new(START_TIME));
        let registry = Arc::new(InMemoryRegistry::with_heartbeat_timeout(
            clock.clone(),
            engine_config.heartbeat_timeout_secs,
        ));
        let network = Arc::new(MemoryNetwork::new());

        let mut peers = Vec::with_capacity(config.peers);
        for i in 0..config.peers {
            let handle = MemoryPeer::spawn_with_key(format!("mem://peer-{i}"), config.capacity, peer_key(i));
            let peer = network
                .register(registry.as_ref(), handle)
                .await
                .expect("peer registration should succeed");
            peers.push(peer);
        }

        let engine = StorageEngine::new(EngineContext::new(
            registry.clone(),
            network.clone(),
            clock.clone(),
            engine_config,
        ))
        .expect("test config should be valid");

        Self {
            config,
            clock,
            registry,
            network,
            peers,
            engine,
        }
    }

    /// Adds one more honest peer after setup.
    pub async fn add_peer(&mut self) -> PeerId {
        let i = self.peers.len();
        let handle = MemoryPeer::spawn_with_key(format!("mem://peer-{i}"), self.config.capacity, peer_key(i));
        let peer = self
            .network
            .register(self.registry.as_ref(), handle)
            .await
            .expect("peer registration should succeed");
        let id = peer.0;
        self.peers.push(peer);
        id
    }

    pub fn handle(&self, peer_id: &PeerId) -> PeerHandle {
        self.network
            .handle_for(peer_id)
            .expect("peer should be routed")
    }

    /// Handle of the peer currently assigned shard `index`.
    pub fn holder(&self, manifest: &FileManifest, index: u16) -> PeerHandle {
        let descriptor = manifest
            .descriptor(index)
            .expect("manifest should describe the shard");
        self.handle(&descriptor.assigned_peer_id)
    }

    /// The coordinator's current manifest.
    pub async fn manifest(&self, manifest: &FileManifest) -> FileManifest {
        self.registry
            .lookup_manifest(&manifest.file_id)
            .await
            .expect("manifest should be published")
    }

    /// Advances the clock one audit interval and runs a round.
    pub async fn audit_round(&self) -> shardvault::AuditReport {
        let now = self.clock.advance(self.engine.context().config.audit_interval_secs);
        self.engine.audit().tick(now).await
    }

    /// Total shards stored across all peers.
    pub async fn stored_shards(&self) -> usize {
        let mut total = 0;
        for (_, handle) in &self.peers {
            total += handle.stats().await.expect("stats").shard_count;
        }
        total
    }
}
