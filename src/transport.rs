//! Peer transport boundary.
//!
//! Peers are reached through explicit request/response operations. Timeouts
//! are not the transport's business: callers wrap every request with
//! [`with_timeout`] using the durations from [`crate::config::EngineConfig`].

use crate::config::AUDIT_NONCE_LEN;
use crate::integrity::{domain_tags, Digest};
use crate::manifest::FileId;
use crate::registry::PeerRecord;
use crate::{Result, VaultError};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::future::Future;
use std::time::Duration;

/// Upload of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutShard {
    pub file_id: FileId,
    pub shard_index: u16,
    pub bytes: Vec<u8>,
    pub content_digest: Digest,
}

/// Acknowledgement of a stored shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutAck {
    pub stored_bytes: u64,
    /// Free space left on the peer after the write
    pub available_storage: u64,
}

/// A proof-of-retrievability challenge for one shard.
///
/// Auditors build these from precomputed tokens
/// ([`crate::audit::ChallengeToken::challenge`]); the holder answers with
/// [`crate::integrity::audit_proof`] over the bytes it stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditChallenge {
    pub file_id: FileId,
    pub shard_index: u16,
    pub nonce: [u8; AUDIT_NONCE_LEN],
}

impl AuditChallenge {
    /// Bytes the peer signs to bind its proof to this challenge.
    pub fn signing_message(&self, proof: &Digest) -> Vec<u8> {
        let mut message = Vec::with_capacity(domain_tags::AUDIT_SIGNATURE.len() + 32 + 2 + AUDIT_NONCE_LEN + 32);
        message.extend_from_slice(domain_tags::AUDIT_SIGNATURE);
        message.extend_from_slice(self.file_id.as_bytes());
        message.extend_from_slice(&self.shard_index.to_le_bytes());
        message.extend_from_slice(&self.nonce);
        message.extend_from_slice(proof.as_bytes());
        message
    }
}

/// A peer's answer to an [`AuditChallenge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditProof {
    pub proof: Digest,
    /// Ed25519 signature over [`AuditChallenge::signing_message`]
    pub signature: Vec<u8>,
}

impl AuditProof {
    /// Checks the signature against the peer's registered key.
    pub fn verify_signature(&self, challenge: &AuditChallenge, public_key: &[u8; 32]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        key.verify(&challenge.signing_message(&self.proof), &signature)
            .is_ok()
    }
}

/// Operations the engine performs against a storage peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn put_shard(&self, peer: &PeerRecord, request: PutShard) -> Result<PutAck>;

    async fn get_shard(&self, peer: &PeerRecord, file_id: &FileId, shard_index: u16)
        -> Result<Vec<u8>>;

    async fn audit_challenge(
        &self,
        peer: &PeerRecord,
        challenge: &AuditChallenge,
    ) -> Result<AuditProof>;

    /// Best-effort removal, used to roll back a failed placement.
    async fn delete_shard(&self, peer: &PeerRecord, file_id: &FileId, shard_index: u16)
        -> Result<()>;
}

/// Runs `fut` with a deadline, mapping expiry to [`VaultError::Timeout`].
pub async fn with_timeout<T, F>(
    duration: Duration,
    peer: &PeerRecord,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(VaultError::Timeout {
            peer_id: peer.peer_id.to_string(),
            operation: operation.to_string(),
        }),
    }
}
