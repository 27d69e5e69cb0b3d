//! The `StorageEngine` struct, the only entry points clients need.

use super::context::EngineContext;
use crate::audit::{AuditEngine, ChallengePool};
use crate::crypto;
use crate::distributor::{PlacementRequest, ShardDistributor};
use crate::erasure;
use crate::integrity;
use crate::manifest::{EncryptionParams, FileId, FileManifest};
use crate::retrieval::RetrievalEngine;
use crate::{Result, VaultError};
use std::sync::Arc;
use tracing::{debug_span, info, Instrument};

/// A storage engine bound to one registry, transport and reputation book.
///
/// Uploaded files are handed to the engine's [`AuditEngine`], which keeps
/// auditing and repairing them for as long as the engine lives.
pub struct StorageEngine {
    ctx: Arc<EngineContext>,
    distributor: Arc<ShardDistributor>,
    retrieval: RetrievalEngine,
    audit: Arc<AuditEngine>,
}

impl StorageEngine {
    /// Validates the configuration and wires the components together.
    pub fn new(ctx: EngineContext) -> Result<Self> {
        ctx.config.validate()?;
        let ctx = Arc::new(ctx);
        let distributor = Arc::new(ShardDistributor::new(ctx.clone()));
        let retrieval = RetrievalEngine::new(ctx.clone());
        let audit = Arc::new(AuditEngine::new(ctx.clone(), distributor.clone()));
        Ok(Self {
            ctx,
            distributor,
            retrieval,
            audit,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn distributor(&self) -> &Arc<ShardDistributor> {
        &self.distributor
    }

    pub fn audit(&self) -> &Arc<AuditEngine> {
        &self.audit
    }

    /// Encrypts, encodes and places a file, returning its content address.
    ///
    /// Either every shard is stored and the manifest is published, or the
    /// call fails and nothing is published.
    pub async fn upload(&self, file_bytes: &[u8], password: &str) -> Result<FileId> {
        let config = &self.ctx.config;
        let span = debug_span!("upload", bytes = file_bytes.len(), k = config.required_shards, n = config.total_shards);
        async move {
            let salt = crypto::generate_salt();
            let kdf = config.kdf_params();
            let key = crypto::derive_key(password, &salt, &kdf)?;
            let sealed = crypto::encrypt(file_bytes, &key)?;

            let file_id = integrity::digest(&sealed.ciphertext);
            let shards = erasure::encode(&sealed.ciphertext, config.required_shards, config.total_shards)?;
            // Audit answers are computed now; the engine keeps no shard bytes
            let challenges: Vec<ChallengePool> = shards
                .iter()
                .map(|shard| ChallengePool::generate(&shard.bytes, config.audit_challenges_per_shard))
                .collect();

            let request = PlacementRequest {
                file_id,
                required_shards: config.required_shards as u16,
                original_length: sealed.ciphertext.len() as u64,
                encryption: EncryptionParams {
                    scheme: crypto::ENCRYPTION_SCHEME.to_string(),
                    salt,
                    kdf,
                    nonce: sealed.nonce,
                    auth_tag: sealed.auth_tag,
                },
                shards,
            };

            let pool = self
                .ctx
                .registry
                .list_peers(config.min_placement_reputation)
                .await?;
            let manifest = self.distributor.place(request, &pool).await?;
            self.audit.watch(manifest, challenges);

            info!(file_id = %file_id.short(), "upload complete");
            Ok(file_id)
        }
        .instrument(span)
        .await
    }

    /// Looks up a file's manifest and returns the original bytes.
    pub async fn download(&self, file_id: &FileId, password: &str) -> Result<Vec<u8>> {
        let span = debug_span!("download", file_id = %file_id.short());
        async move {
            let manifest = self.manifest(file_id).await?;
            self.retrieval.fetch(&manifest, password).await
        }
        .instrument(span)
        .await
    }

    /// The coordinator's current manifest for `file_id`.
    pub async fn manifest(&self, file_id: &FileId) -> Result<FileManifest> {
        let manifest = self.ctx.registry.lookup_manifest(file_id).await?;
        if &manifest.file_id != file_id {
            return Err(VaultError::InvalidManifest {
                reason: "coordinator returned a manifest for another file".to_string(),
            });
        }
        Ok(manifest)
    }
}
