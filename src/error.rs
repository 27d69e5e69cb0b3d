//! Error types for the shardvault storage engine

/// Error types for the shardvault storage engine
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Wrong password or tampered ciphertext. The two cases are deliberately
    /// indistinguishable.
    #[error("Authentication failure: cannot decrypt (wrong password or corrupted data)")]
    AuthenticationFailure,

    /// Fewer distinct, valid shards than the encoding requires
    #[error("Insufficient shards: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    /// Shards supplied to the decoder come from different encodings
    #[error("Inconsistent shards: shards were produced by different encodings")]
    InconsistentShards,

    /// Not enough verified shards could be fetched for a file
    #[error("Retrieval failure for {file_id}: {verified} verified shards, {required} required")]
    RetrievalFailure {
        file_id: String,
        verified: usize,
        required: usize,
    },

    /// A shard's bytes do not match the digest recorded in the manifest
    #[error("Integrity violation: shard {shard_index} from peer {peer_id}")]
    IntegrityViolation { shard_index: u16, peer_id: String },

    /// Redundancy cannot be satisfied at upload time
    #[error("Placement failure: {reason}")]
    PlacementFailure { reason: String },

    /// Peer could not be reached (connection dropped or actor gone)
    #[error("Peer unreachable: {peer_id}")]
    Unreachable { peer_id: String },

    /// Peer did not answer within the operation timeout
    #[error("Timeout: {operation} on peer {peer_id}")]
    Timeout { peer_id: String, operation: String },

    /// Peer refused a request
    #[error("Peer {peer_id} rejected request: {reason}")]
    Rejected { peer_id: String, reason: String },

    /// Peer does not hold the requested shard
    #[error("Shard not found: {file_id}#{shard_index}")]
    ShardNotFound { file_id: String, shard_index: u16 },

    /// Coordinator has no manifest for this file
    #[error("Manifest not found: {file_id}")]
    ManifestNotFound { file_id: String },

    /// Manifest failed a consistency check
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Coordinator does not know this peer
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },

    /// Invalid input parameters (generic fallback)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid (k, n) erasure parameters
    #[error("Invalid erasure parameters: k={required}, n={total} (need 1 <= k < n <= {max})", max = crate::config::MAX_TOTAL_SHARDS)]
    InvalidErasureParams { required: usize, total: usize },

    /// Erasure coding library failure
    #[error("Erasure coding error: {details}")]
    ErasureCoding { details: String },

    /// Key derivation failed (bad KDF parameters)
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Cryptographic(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    IO(String),
}

impl VaultError {
    /// Network-level failures that are worth retrying against the same peer.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Unreachable { .. } | VaultError::Timeout { .. })
    }
}

/// Convenience Result type for storage engine operations
pub type Result<T> = std::result::Result<T, VaultError>;
