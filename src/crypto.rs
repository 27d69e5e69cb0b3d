//! Password-based key derivation and whole-file authenticated encryption.
//!
//! Keys are derived with Argon2id and never leave the client: neither the
//! coordinator nor any peer sees them. Files are sealed with AES-256-GCM
//! before erasure coding, with the nonce and tag kept detached so they can be
//! recorded in the manifest.
//!
//! Decryption fails closed: a wrong password and a tampered ciphertext both
//! produce [`VaultError::AuthenticationFailure`], and nothing else, so the
//! engine cannot be used as a password oracle.

use crate::config::{KEY_LEN, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::manifest::KdfParams;
use crate::{Result, VaultError};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Label recorded in manifests for the scheme implemented here.
pub const ENCRYPTION_SCHEME: &str = "AES-256-GCM+Argon2id";

/// A derived file key. Zeroed when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_LEN],
}

impl FileKey {
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Raw key bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey(..)")
    }
}

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LEN],
    pub nonce: [u8; NONCE_LEN],
}

/// Fresh random salt for a new upload.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derives a file key from a password.
///
/// Deterministic: the same password, salt and parameters always give the same
/// key. `params.iterations` is the Argon2 time cost.
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<FileKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::KeyDerivation(format!("invalid Argon2 parameters: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| VaultError::KeyDerivation(format!("Argon2 failed: {e}")))?;
    Ok(FileKey { key })
}

/// Encrypts `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &FileKey) -> Result<Sealed> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(plaintext, key, nonce)
}

fn encrypt_with_nonce(plaintext: &[u8], key: &FileKey, nonce: [u8; NONCE_LEN]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Cryptographic(format!("Failed to create cipher: {e}")))?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| VaultError::Cryptographic(format!("Encryption failed: {e}")))?;

    let mut auth_tag = [0u8; TAG_LEN];
    auth_tag.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        ciphertext: buffer,
        auth_tag,
        nonce,
    })
}

/// Decrypts and authenticates.
///
/// Returns [`VaultError::AuthenticationFailure`] on any mismatch: wrong key,
/// flipped ciphertext bit, flipped tag bit, or wrong nonce.
pub fn decrypt(
    ciphertext: &[u8],
    auth_tag: &[u8; TAG_LEN],
    nonce: &[u8; NONCE_LEN],
    key: &FileKey,
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Cryptographic(format!("Failed to create cipher: {e}")))?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            &mut buffer,
            Tag::from_slice(auth_tag),
        )
        .map_err(|_| {
            buffer.zeroize();
            VaultError::AuthenticationFailure
        })?;
    Ok(buffer)
}
