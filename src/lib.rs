//! Shardvault storage engine
//!
//! This library implements the storage engine of a decentralized encrypted
//! object store. Files are encrypted on the client, split into redundant
//! Reed-Solomon shards and scattered across untrusted peers; a coordinator
//! only keeps the peer directory and file manifests.
//!
//! ## Main Components
//!
//! - [`crypto`]: Argon2id key derivation and AES-256-GCM file encryption
//! - [`erasure`]: Reed-Solomon encoding where any `k` of `n` shards reconstruct
//! - [`integrity`]: SHA-256 digests, manifest checks and audit proofs
//! - [`reputation`]: Evidence-based peer scores and placement ranking
//! - [`distributor`]: Diversity-constrained placement and single-shard repair
//! - [`retrieval`]: First-k-wins parallel retrieval and decryption
//! - [`audit`]: Periodic proof-of-retrievability challenges that trigger repair
//! - [`api`]: `StorageEngine` with `upload` and `download`
//!
//! The coordinator and peers are reached through the [`registry::PeerRegistry`]
//! and [`transport::PeerTransport`] traits. [`registry::InMemoryRegistry`] and
//! [`peer::MemoryNetwork`] implement both in-process for simulation and tests.
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Result<T>`], an alias over
//! [`VaultError`]. Download failures stay distinguishable:
//!
//! - [`VaultError::AuthenticationFailure`]: wrong password or tampered ciphertext
//! - [`VaultError::RetrievalFailure`]: not enough verified shards, even after a retry
//! - [`VaultError::PlacementFailure`]: upload could not satisfy redundancy; nothing was published
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shardvault::api::{EngineContext, StorageEngine};
//! use shardvault::clock::SystemClock;
//! use shardvault::config::EngineConfig;
//! use shardvault::peer::MemoryNetwork;
//! use shardvault::registry::InMemoryRegistry;
//! use std::sync::Arc;
//!
//! # async fn demo() -> shardvault::Result<()> {
//! let clock = Arc::new(SystemClock);
//! let registry = Arc::new(InMemoryRegistry::new(clock.clone()));
//! let network = Arc::new(MemoryNetwork::new());
//! for i in 0..30 {
//!     network.spawn_peer(registry.as_ref(), format!("mem://peer-{i}"), 1 << 24).await?;
//! }
//!
//! let engine = StorageEngine::new(EngineContext::new(
//!     registry,
//!     network,
//!     clock,
//!     EngineConfig::default(),
//! ))?;
//! let file_id = engine.upload(b"Hello, world!", "pw").await?;
//! assert_eq!(engine.download(&file_id, "pw").await?, b"Hello, world!");
//!
//! // Audit every stored shard once
//! let report = engine.audit().tick(engine.context().clock.now()).await;
//! assert_eq!(report.verified, report.challenged);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod distributor;
pub mod erasure;
pub mod error;
pub mod integrity;
pub mod manifest;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod reputation;
pub mod retrieval;
pub mod transport;

// Re-export commonly used types for convenience
pub use api::{EngineContext, StorageEngine};
pub use audit::{AuditEngine, AuditReport, AuditResult, ChallengePool, ShardAuditState};
pub use distributor::{PlacementRequest, Repaired, ShardDistributor};
pub use error::{Result, VaultError};
pub use integrity::Digest;
pub use manifest::{FileId, FileManifest, ShardDescriptor};
pub use registry::{PeerId, PeerRecord, PeerRegistry};
pub use reputation::{Outcome, ReputationTracker};
pub use retrieval::RetrievalEngine;
pub use transport::PeerTransport;
