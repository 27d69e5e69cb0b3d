//! Content digests and consistency checks.
//!
//! Every fingerprint in the engine is SHA-256. Plain content digests
//! ([`digest`]) identify bytes: shard contents and the ciphertext itself (the
//! file id). Derived values such as audit proofs and encoding identifiers are
//! computed with [`hash_tagged`] so that a value from one context can never be
//! replayed in another.

use crate::config::{self, DIGEST_LEN};
use crate::manifest::{FileManifest, ShardDescriptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A 32-byte SHA-256 fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::VaultError::InvalidInput(format!("invalid digest hex: {e}")))?;
        let array: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| {
            crate::VaultError::InvalidInput(format!("digest must be {DIGEST_LEN} bytes"))
        })?;
        Ok(Digest(array))
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

/// Domain separation tags for tagged hashing contexts
pub mod domain_tags {
    /// Audit proof: H(tag || shard_bytes || nonce)
    pub const AUDIT_PROOF: &[u8] = b"shardvault/audit-proof/v1";
    /// Encoding identifier shared by all shards of one encoding
    pub const ENCODING_ID: &[u8] = b"shardvault/encoding-id/v1";
    /// Peer identifier derived from a public key
    pub const PEER_ID: &[u8] = b"shardvault/peer-id/v1";
    /// Digest of a whole manifest (descriptors included)
    pub const MANIFEST: &[u8] = b"shardvault/manifest/v1";
    /// Message a peer signs when answering an audit challenge
    pub const AUDIT_SIGNATURE: &[u8] = b"shardvault/audit-signature/v1";
}

/// Plain SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> Digest {
    Digest(Sha256::digest(bytes).into())
}

/// SHA-256 over a domain tag followed by length-prefixed parts.
pub fn hash_tagged(tag: &[u8], parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update((tag.len() as u32).to_le_bytes());
    hasher.update(tag);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    Digest(hasher.finalize().into())
}

/// Checks a shard's bytes against the digest its descriptor records.
pub fn verify_shard(shard_bytes: &[u8], descriptor: &ShardDescriptor) -> bool {
    digest(shard_bytes) == descriptor.content_digest
}

/// Answer to an audit challenge over the full shard contents.
///
/// The nonce is hashed after the bytes, so the answer cannot be computed
/// from any fixed-size summary of the shard. Auditors never hold shard bytes
/// for long; they precompute answers while the bytes pass through (see
/// [`crate::audit::ChallengePool`]).
pub fn audit_proof(shard_bytes: &[u8], nonce: &[u8]) -> Digest {
    hash_tagged(domain_tags::AUDIT_PROOF, &[shard_bytes, nonce])
}

/// Identifier shared by every shard of a single encoding.
pub fn encoding_id(data_digest: &Digest, required: usize, total: usize, original_len: usize) -> Digest {
    hash_tagged(
        domain_tags::ENCODING_ID,
        &[
            data_digest.as_bytes(),
            &(required as u64).to_le_bytes(),
            &(total as u64).to_le_bytes(),
            &(original_len as u64).to_le_bytes(),
        ],
    )
}

/// Fingerprint of the full manifest, including placement.
pub fn manifest_digest(manifest: &FileManifest) -> crate::Result<Digest> {
    let body = bincode::serialize(manifest)
        .map_err(|e| crate::VaultError::Serialization(format!("Failed to serialize manifest: {e}")))?;
    Ok(hash_tagged(domain_tags::MANIFEST, &[&body]))
}

/// Internal consistency of a manifest.
///
/// Checks `1 <= k < n <= 256`, exactly one descriptor per index `0..n`, and
/// that `shard_size` matches `ceil(original_length / k)` (minimum 1).
pub fn verify_manifest(manifest: &FileManifest) -> bool {
    manifest_problem(manifest).is_none()
}

/// Like [`verify_manifest`] but says what is wrong.
pub fn manifest_problem(manifest: &FileManifest) -> Option<String> {
    let k = manifest.required_shards as usize;
    let n = manifest.total_shards as usize;
    if config::validate_erasure_params(k, n).is_err() {
        return Some(format!("invalid redundancy k={k}, n={n}"));
    }
    if manifest.shards.len() != n {
        return Some(format!(
            "expected {n} shard descriptors, found {}",
            manifest.shards.len()
        ));
    }
    let mut seen = vec![false; n];
    for descriptor in &manifest.shards {
        let index = descriptor.shard_index as usize;
        if index >= n {
            return Some(format!("shard index {index} out of range"));
        }
        if seen[index] {
            return Some(format!("duplicate shard index {index}"));
        }
        seen[index] = true;
    }
    let expected_size = crate::erasure::shard_len(manifest.original_length as usize, k);
    if manifest.shard_size as usize != expected_size {
        return Some(format!(
            "shard_size {} does not match expected {expected_size}",
            manifest.shard_size
        ));
    }
    None
}
