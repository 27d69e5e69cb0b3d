//! Reed-Solomon erasure coding for file ciphertext.
//!
//! A file of `len` bytes is split into `k` data shards of `ceil(len / k)` bytes
//! (zero padded, minimum one byte) and extended with `n - k` parity shards over
//! GF(2^8). Any `k` distinct shards reconstruct the input exactly; decode trims
//! the padding using the original length recorded in the manifest.
//!
//! ## Example
//!
//! ```rust
//! use shardvault::erasure::{decode, encode, CodecParams};
//!
//! let data = b"hello, world";
//! let shards = encode(data, 2, 4)?;
//!
//! // Any two of the four shards are enough.
//! let subset = vec![shards[1].clone(), shards[3].clone()];
//! let params = CodecParams::new(2, 4, data.len());
//! assert_eq!(decode(&subset, &params)?, data);
//! # Ok::<(), shardvault::VaultError>(())
//! ```

use crate::config;
use crate::integrity::{self, Digest};
use crate::{Result, VaultError};
use reed_solomon_erasure::galois_8::ReedSolomon;

/// One erasure-coded fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Position in the codeword, `0..n`; data shards come first
    pub index: u16,
    /// Identifier shared by every shard of the same encoding
    pub encoding_id: Digest,
    pub bytes: Vec<u8>,
}

/// Parameters needed to undo an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    /// k
    pub required: usize,
    /// n
    pub total: usize,
    /// Length of the encoded input before padding
    pub original_len: usize,
}

impl CodecParams {
    pub fn new(required: usize, total: usize, original_len: usize) -> Self {
        Self {
            required,
            total,
            original_len,
        }
    }

    pub fn shard_len(&self) -> usize {
        shard_len(self.original_len, self.required)
    }
}

/// Byte length of every shard for `data_len` bytes split `k` ways.
pub fn shard_len(data_len: usize, required: usize) -> usize {
    data_len.div_ceil(required.max(1)).max(1)
}

fn codec(required: usize, total: usize) -> Result<ReedSolomon> {
    config::validate_erasure_params(required, total)?;
    ReedSolomon::new(required, total - required).map_err(|e| VaultError::ErasureCoding {
        details: format!("Reed-Solomon setup failed: {e}"),
    })
}

/// Encodes `data` into `total` shards, any `required` of which reconstruct it.
///
/// # Arguments
///
/// * `data` - Bytes to encode (may be empty)
/// * `required` - k, the number of data shards
/// * `total` - n, data plus parity shards; must satisfy `1 <= k < n <= 256`
///
/// # Returns
///
/// The `n` shards in index order, all of length [`shard_len`] and all carrying
/// the same encoding identifier.
pub fn encode(data: &[u8], required: usize, total: usize) -> Result<Vec<Shard>> {
    let rs = codec(required, total)?;
    let size = shard_len(data.len(), required);

    let mut buffers: Vec<Vec<u8>> = Vec::with_capacity(total);
    for i in 0..required {
        let start = (i * size).min(data.len());
        let end = ((i + 1) * size).min(data.len());
        let mut chunk = data[start..end].to_vec();
        chunk.resize(size, 0); // Pad final chunk
        buffers.push(chunk);
    }
    buffers.resize(total, vec![0; size]);

    rs.encode(&mut buffers).map_err(|e| VaultError::ErasureCoding {
        details: format!("RS encode failed: {e}"),
    })?;

    let encoding_id = integrity::encoding_id(&integrity::digest(data), required, total, data.len());
    Ok(buffers
        .into_iter()
        .enumerate()
        .map(|(index, bytes)| Shard {
            index: index as u16,
            encoding_id,
            bytes,
        })
        .collect())
}

/// Reconstructs the original bytes from any `k` distinct shards.
///
/// Shards with an out-of-range index or the wrong length are ignored, as are
/// repeated indices after the first. Order does not matter.
///
/// # Errors
///
/// * [`VaultError::InconsistentShards`] if the shards carry different encoding ids
/// * [`VaultError::InsufficientShards`] if fewer than `k` usable indices remain
pub fn decode(shards: &[Shard], params: &CodecParams) -> Result<Vec<u8>> {
    let rs = codec(params.required, params.total)?;

    if let Some(first) = shards.first() {
        if shards.iter().any(|s| s.encoding_id != first.encoding_id) {
            return Err(VaultError::InconsistentShards);
        }
    }

    let size = params.shard_len();
    let mut slots: Vec<Option<Vec<u8>>> = vec![None; params.total];
    let mut present = 0;
    for shard in shards {
        let index = shard.index as usize;
        if index >= params.total || shard.bytes.len() != size || slots[index].is_some() {
            continue;
        }
        slots[index] = Some(shard.bytes.clone());
        present += 1;
    }

    if present < params.required {
        return Err(VaultError::InsufficientShards {
            have: present,
            need: params.required,
        });
    }

    rs.reconstruct_data(&mut slots)
        .map_err(|e| VaultError::ErasureCoding {
            details: format!("RS decode failed: {e}"),
        })?;

    let mut reconstructed = Vec::with_capacity(size * params.required);
    for slot in slots.iter().take(params.required).flatten() {
        reconstructed.extend_from_slice(slot);
    }

    // Truncate to original size
    reconstructed.truncate(params.original_len);
    Ok(reconstructed)
}
