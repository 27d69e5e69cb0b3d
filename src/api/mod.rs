//! High-level engine API.
//!
//! [`StorageEngine`] exposes the two operations the rest of a deployment
//! needs: `upload` and `download`. Everything it depends on (coordinator,
//! peer transport, reputation book, clock, configuration) is passed in
//! explicitly through an [`EngineContext`], so an engine can run against the
//! in-memory registry and peer network as easily as against real services.
//!
//! ## Workflow
//!
//! 1. **`upload()`**: derives a key from the password, encrypts the file,
//!    erasure codes the ciphertext, places the `n` shards on distinct peers
//!    and publishes the manifest. Returns the file id (digest of the ciphertext).
//! 2. **`download()`**: looks the manifest up, fetches the first `k` verified
//!    shards, decodes and decrypts.
//! 3. **Auditing**: uploaded files are watched by the engine's
//!    [`crate::audit::AuditEngine`]; call `tick` or `run` on it to challenge
//!    holders and repair lost shards.
//!
//! ## Example
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
//! for i in 0..6 {
//!     network.spawn_peer(registry.as_ref(), format!("mem://peer-{i}"), 1 << 20).await?;
//! }
//!
//! let config = EngineConfig {
//!     required_shards: 2,
//!     total_shards: 4,
//!     ..Default::default()
//! };
//! let engine = StorageEngine::new(EngineContext::new(registry, network, clock, config))?;
//!
//! let file_id = engine.upload(b"hello", "correct horse").await?;
//! assert_eq!(engine.download(&file_id, "correct horse").await?, b"hello");
//! # Ok(())
//! # }
//! ```

mod context;
mod system;

pub use context::EngineContext;
pub use system::StorageEngine;
