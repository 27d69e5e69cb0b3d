//! File manifests: the authoritative record of how a file was encrypted,
//! encoded and placed.
//!
//! A manifest is content-addressed by its `file_id` (the SHA-256 of the
//! ciphertext). The persisted form is a small versioned binary envelope:
//!
//! ```text
//! magic "SVMF" (4) | version u16 LE (2) | length u32 LE (4) | bincode body
//! ```

use crate::config::{self, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::erasure::CodecParams;
use crate::integrity::{self, Digest};
use crate::registry::PeerId;
use crate::{Result, VaultError};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Content address of a stored file (digest of its ciphertext).
pub type FileId = Digest;

/// Argon2id parameters recorded so the key can be re-derived at download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Time cost
    pub iterations: u32,
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: config::DEFAULT_KDF_ITERATIONS,
            memory_kib: config::DEFAULT_KDF_MEMORY_KIB,
            parallelism: config::DEFAULT_KDF_PARALLELISM,
        }
    }
}

/// Everything needed, besides the password, to decrypt the reconstructed ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub scheme: String,
    pub salt: [u8; SALT_LEN],
    pub kdf: KdfParams,
    pub nonce: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
}

/// One shard's entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_index: u16,
    pub content_digest: Digest,
    pub assigned_peer_id: PeerId,
    /// Bumped on every re-placement so stale assignments are detectable
    pub assignment_version: u32,
}

/// The public record of one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: FileId,
    pub total_shards: u16,
    pub required_shards: u16,
    pub shard_size: u64,
    /// Ciphertext length before erasure padding
    pub original_length: u64,
    pub encryption: EncryptionParams,
    /// Unix seconds
    pub created_at: u64,
    /// One descriptor per index, in index order
    pub shards: Vec<ShardDescriptor>,
}

/// Constants for manifest serialization format
mod manifest_format {
    /// Magic bytes identifying the manifest format
    pub const MAGIC: &[u8] = b"SVMF";

    /// Header size in bytes: magic(4) + version(2) + length(4)
    pub const HEADER_SIZE: usize = 10;
}

fn bincode_options() -> impl bincode::Options {
    // Pinned so the wire format stays stable even if bincode's defaults change.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl FileManifest {
    pub fn codec_params(&self) -> CodecParams {
        CodecParams::new(
            self.required_shards as usize,
            self.total_shards as usize,
            self.original_length as usize,
        )
    }

    /// Encoding identifier every shard of this file carries.
    pub fn encoding_id(&self) -> Digest {
        integrity::encoding_id(
            &self.file_id,
            self.required_shards as usize,
            self.total_shards as usize,
            self.original_length as usize,
        )
    }

    pub fn descriptor(&self, shard_index: u16) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|d| d.shard_index == shard_index)
    }

    pub(crate) fn descriptor_mut(&mut self, shard_index: u16) -> Option<&mut ShardDescriptor> {
        self.shards.iter_mut().find(|d| d.shard_index == shard_index)
    }

    /// Peers currently holding a shard of this file.
    pub fn holders(&self) -> impl Iterator<Item = &PeerId> {
        self.shards.iter().map(|d| &d.assigned_peer_id)
    }

    /// Ratio n / k.
    pub fn redundancy_factor(&self) -> f64 {
        self.total_shards as f64 / self.required_shards as f64
    }

    /// Serialize this manifest to its persisted form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode_options().serialize(self).map_err(|e| {
            VaultError::Serialization(format!("Failed to serialize manifest: {}", e))
        })?;

        if body.len() > config::MAX_MANIFEST_SIZE_BYTES {
            return Err(VaultError::InvalidManifest {
                reason: format!(
                    "serialized size {} bytes exceeds maximum {} bytes",
                    body.len(),
                    config::MAX_MANIFEST_SIZE_BYTES
                ),
            });
        }

        let mut result = Vec::with_capacity(manifest_format::HEADER_SIZE + body.len());
        result.extend_from_slice(manifest_format::MAGIC);
        result.extend_from_slice(&config::MANIFEST_FORMAT_VERSION.to_le_bytes());
        result.extend_from_slice(&(body.len() as u32).to_le_bytes());
        result.extend_from_slice(&body);
        Ok(result)
    }

    /// Deserialize a manifest from its persisted form.
    ///
    /// Validates magic, version and length, and rejects manifests that fail
    /// [`integrity::verify_manifest`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < manifest_format::HEADER_SIZE {
            return Err(VaultError::Serialization(
                "Manifest bytes too short for header".to_string(),
            ));
        }

        if &bytes[0..4] != manifest_format::MAGIC {
            return Err(VaultError::Serialization(
                "Invalid magic bytes in manifest".to_string(),
            ));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != config::MANIFEST_FORMAT_VERSION {
            return Err(VaultError::Serialization(format!(
                "Unsupported manifest format version: {}",
                version
            )));
        }

        let length = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        if length > config::MAX_MANIFEST_SIZE_BYTES {
            return Err(VaultError::Serialization(format!(
                "Manifest length {length} exceeds maximum"
            )));
        }
        let expected_len = manifest_format::HEADER_SIZE + length;
        if bytes.len() < expected_len {
            return Err(VaultError::Serialization(
                "Manifest bytes truncated".to_string(),
            ));
        }
        if bytes.len() > expected_len {
            return Err(VaultError::Serialization(
                "Manifest bytes contain trailing data".to_string(),
            ));
        }

        let manifest: FileManifest = bincode_options()
            .deserialize(&bytes[manifest_format::HEADER_SIZE..])
            .map_err(|e| {
                VaultError::Serialization(format!("Failed to deserialize manifest: {}", e))
            })?;

        if let Some(reason) = integrity::manifest_problem(&manifest) {
            return Err(VaultError::InvalidManifest { reason });
        }
        Ok(manifest)
    }

    /// Human-readable JSON for the coordinator directory and tooling.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::Serialization(format!("Failed to encode manifest JSON: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: FileManifest = serde_json::from_str(json)
            .map_err(|e| VaultError::Serialization(format!("Failed to decode manifest JSON: {e}")))?;
        if let Some(reason) = integrity::manifest_problem(&manifest) {
            return Err(VaultError::InvalidManifest { reason });
        }
        Ok(manifest)
    }
}
