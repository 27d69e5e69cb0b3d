//! Parallel shard retrieval, reconstruction and decryption.
//!
//! Every shard holder is asked at once. Shards are verified against their
//! descriptor as they arrive and the first `k` verified, distinct shards win;
//! the rest of the requests are dropped, which cancels them without any
//! reputation effect.
//!
//! A shortfall is retried once. The retry asks only the holders that failed
//! transiently: a holder that served bad bytes or reported the shard lost has
//! already been penalized and is not asked again.

use crate::api::EngineContext;
use crate::crypto;
use crate::erasure::{self, Shard};
use crate::integrity;
use crate::manifest::{FileManifest, ShardDescriptor};
use crate::metrics::EngineMetrics;
use crate::registry::PeerRecord;
use crate::reputation::Outcome;
use crate::{Result, VaultError};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, debug_span, error, info, warn, Instrument};

/// Shards gathered by one pass over the holders.
struct Gathered {
    verified: Vec<Shard>,
    /// Indices whose holder served bad bytes or had lost the shard
    rejected: Vec<u16>,
}

/// Fetches and reassembles files described by manifests.
pub struct RetrievalEngine {
    ctx: Arc<EngineContext>,
}

impl RetrievalEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Downloads, decodes and decrypts a file.
    ///
    /// A shortfall of verified shards is retried once after
    /// `retrieval_retry_delay`; a second shortfall is a
    /// [`VaultError::RetrievalFailure`]. A decryption failure is returned as
    /// [`VaultError::AuthenticationFailure`] and is never retried.
    pub async fn fetch(&self, manifest: &FileManifest, password: &str) -> Result<Vec<u8>> {
        let span = debug_span!("fetch", file_id = %manifest.file_id.short());
        async move {
            if let Some(reason) = integrity::manifest_problem(manifest) {
                return Err(VaultError::InvalidManifest { reason });
            }

            let need = manifest.required_shards as usize;
            let first = self.gather(manifest, &[], need).await;
            let mut shards = first.verified;
            if shards.len() < need {
                warn!(have = shards.len(), need, "too few shards, retrying once");
                tokio::time::sleep(self.ctx.config.retrieval_retry_delay()).await;
                let mut skip = first.rejected;
                skip.extend(shards.iter().map(|s| s.index));
                let second = self.gather(manifest, &skip, need - shards.len()).await;
                shards.extend(second.verified);
                if shards.len() < need {
                    return Err(VaultError::RetrievalFailure {
                        file_id: manifest.file_id.to_string(),
                        verified: shards.len(),
                        required: need,
                    });
                }
            }

            let ciphertext = erasure::decode(&shards, &manifest.codec_params())?;
            if integrity::digest(&ciphertext) != manifest.file_id {
                error!("reconstructed ciphertext does not match its file id");
                return Err(VaultError::InvalidManifest {
                    reason: "reconstructed ciphertext does not match file id".to_string(),
                });
            }

            let encryption = &manifest.encryption;
            let key = crypto::derive_key(password, &encryption.salt, &encryption.kdf)?;
            match crypto::decrypt(&ciphertext, &encryption.auth_tag, &encryption.nonce, &key) {
                Ok(plaintext) => {
                    info!(bytes = plaintext.len(), "file retrieved");
                    Ok(plaintext)
                }
                Err(e) => {
                    error!(error = %e, "decryption failed on verified shards");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Gathers `k` verified shards, skipping the indices in `exclude`.
    ///
    /// Returns [`VaultError::InsufficientShards`] when every request has
    /// resolved with fewer than `k` verified shards.
    pub async fn collect_shards(&self, manifest: &FileManifest, exclude: &[u16]) -> Result<Vec<Shard>> {
        let need = manifest.required_shards as usize;
        let gathered = self.gather(manifest, exclude, need).await;
        if gathered.verified.len() < need {
            return Err(VaultError::InsufficientShards {
                have: gathered.verified.len(),
                need,
            });
        }
        Ok(gathered.verified)
    }

    /// Asks every holder outside `exclude` at once and stops after `need`
    /// verified shards.
    async fn gather(&self, manifest: &FileManifest, exclude: &[u16], need: usize) -> Gathered {
        let encoding_id = manifest.encoding_id();

        let mut holders = Vec::with_capacity(manifest.shards.len());
        for descriptor in manifest.shards.iter().filter(|d| !exclude.contains(&d.shard_index)) {
            match self.ctx.registry.get_peer(&descriptor.assigned_peer_id).await {
                Ok(peer) => holders.push((descriptor, peer)),
                Err(e) => debug!(shard = descriptor.shard_index, error = %e, "holder unknown"),
            }
        }

        let mut pending: FuturesUnordered<_> = holders
            .iter()
            .map(|(descriptor, peer)| self.fetch_one(manifest, descriptor, peer))
            .collect();

        let mut verified: Vec<Shard> = Vec::with_capacity(need);
        let mut rejected = Vec::new();
        let mut seen = BTreeSet::new();
        while let Some((descriptor, peer, result)) = pending.next().await {
            match result {
                Ok(bytes) if integrity::verify_shard(&bytes, descriptor) => {
                    EngineMetrics::incr(&self.ctx.metrics.shards_fetched);
                    EngineMetrics::add(&self.ctx.metrics.bytes_fetched, bytes.len() as u64);
                    self.ctx.report(&peer.peer_id, Outcome::SuccessfulTransfer).await;
                    if seen.insert(descriptor.shard_index) {
                        verified.push(Shard {
                            index: descriptor.shard_index,
                            encoding_id,
                            bytes,
                        });
                    }
                    if verified.len() >= need {
                        break;
                    }
                }
                Ok(_) => {
                    warn!(
                        shard = descriptor.shard_index,
                        peer = %peer.peer_id.short(),
                        "shard failed verification, discarded"
                    );
                    EngineMetrics::incr(&self.ctx.metrics.integrity_violations);
                    self.ctx.report(&peer.peer_id, Outcome::IntegrityViolation).await;
                    rejected.push(descriptor.shard_index);
                }
                Err(VaultError::ShardNotFound { .. }) => {
                    warn!(shard = descriptor.shard_index, peer = %peer.peer_id.short(), "holder lost shard");
                    self.ctx.report(&peer.peer_id, Outcome::AuditFail).await;
                    rejected.push(descriptor.shard_index);
                }
                Err(e) => {
                    debug!(shard = descriptor.shard_index, peer = %peer.peer_id.short(), error = %e, "fetch failed");
                }
            }
        }
        // Dropping the set cancels the stragglers
        drop(pending);

        debug!(indices = ?seen, rejected = rejected.len(), "gathered shards");
        Gathered { verified, rejected }
    }

    async fn fetch_one<'a>(
        &self,
        manifest: &FileManifest,
        descriptor: &'a ShardDescriptor,
        peer: &'a PeerRecord,
    ) -> (&'a ShardDescriptor, &'a PeerRecord, Result<Vec<u8>>) {
        let transport = &self.ctx.transport;
        let file_id = &manifest.file_id;
        let index = descriptor.shard_index;
        let result = self
            .ctx
            .transfer(peer, "get_shard", move || transport.get_shard(peer, file_id, index))
            .await;
        (descriptor, peer, result)
    }
}
