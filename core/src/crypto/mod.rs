//! The encryption envelope: master-key wrapping of per-file keys, AEAD
//! sealing of whole files and chunks, and convergent per-block keys.
//!
//! AES-256-GCM throughout (`aes-gcm`), following the same "prepend a random
//! nonce to the ciphertext" shape the teacher uses for signing material.
//! Convergent block keys are derived with PBKDF2-HMAC-SHA256 over the
//! block's own content hash, so identical plaintext always seals to
//! identical ciphertext — that's what lets blocks be deduplicated *after*
//! encryption without leaking anything beyond "this block is a duplicate".

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use displaydoc::Display;
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CoreResult;

/// Size in bytes of an AES-256 key.
pub const KEY_SIZE: usize = 32;

/// Size in bytes of the AES-GCM nonce.
pub const NONCE_SIZE: usize = 12;

/// Fixed salt for convergent key derivation.
///
/// This is intentionally not random: the whole point of convergent
/// encryption is that identical plaintext derives an identical key.
const CONVERGENT_SALT: &[u8] = b"dedup_convergent_encryption_salt";

/// PBKDF2 iteration count for convergent key derivation.
const CONVERGENT_ITERATIONS: u32 = 100_000;

/// An encryption error.
#[derive(Debug, Display)]
pub enum Error {
    /// AEAD seal/open failed (wrong key, corrupted ciphertext, or AAD mismatch)
    AeadFailure,

    /// Ciphertext is shorter than the nonce
    Truncated,

    /// Master key must be exactly 32 bytes, got {0}
    InvalidMasterKeyLength(usize),
}

/// A 32-byte AES-256 key, held only in memory.
#[derive(Clone)]
pub struct FileKey([u8; KEY_SIZE]);

impl FileKey {
    /// Generates a new random file key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the convergent key for a block from its plaintext content hash.
    ///
    /// `content_hash` is the raw (not hex-encoded) SHA-256 digest of the
    /// block's plaintext.
    pub fn derive_convergent(content_hash: &[u8; 32]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::<Hmac<Sha256>>(content_hash, CONVERGENT_SALT, CONVERGENT_ITERATIONS, &mut key)
            .expect("HMAC can be initialized with any key length");
        Self(key)
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileKey(..)")
    }
}

/// The master key, derived once at startup and never persisted.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Loads the master key from a base64-encoded 32-byte value, as set in
    /// `ENCRYPTION_MASTER_KEY`.
    pub fn from_base64(encoded: &str) -> CoreResult<Self> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| Error::InvalidMasterKeyLength(0))?;
        let bytes: [u8; KEY_SIZE] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidMasterKeyLength(decoded.len()))?;
        Ok(Self(bytes))
    }

    /// Derives a fallback master key by hashing a secret string.
    ///
    /// Used when `ENCRYPTION_MASTER_KEY` is unset but `SECRET_KEY` is
    /// available; weaker than a dedicated random key but keeps the service
    /// usable in development.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self(digest.into())
    }

    /// Wraps a file key under the master key. Returns `nonce || ciphertext`.
    pub fn wrap(&self, file_key: &FileKey) -> Vec<u8> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ct = cipher
            .encrypt(nonce, file_key.as_bytes().as_slice())
            .expect("encryption with a freshly generated nonce cannot fail");

        let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        out
    }

    /// Unwraps a file key wrapped by [`Self::wrap`].
    pub fn unwrap_key(&self, wrapped: &[u8]) -> CoreResult<FileKey> {
        if wrapped.len() < NONCE_SIZE {
            return Err(Error::Truncated.into());
        }
        let (nonce_bytes, ct) = wrapped.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ct)
            .map_err(|_| Error::AeadFailure)?;

        let bytes: [u8; KEY_SIZE] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| Error::AeadFailure)?;
        Ok(FileKey(bytes))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Seals a whole file (the "single" and "inline" placement strategies) with
/// no associated data. Returns `nonce || ciphertext || tag`.
pub fn seal_whole_file(key: &FileKey, plaintext: &[u8]) -> Vec<u8> {
    seal(key, plaintext, &[], None)
}

/// Opens a whole file sealed by [`seal_whole_file`].
pub fn open_whole_file(key: &FileKey, sealed: &[u8]) -> CoreResult<Vec<u8>> {
    open(key, sealed, &[], None)
}

/// Seals a single chunk, binding `chunk_index` as associated data so
/// ciphertext blocks cannot be silently reordered or substituted between
/// chunk positions within the same file.
pub fn seal_chunk(key: &FileKey, plaintext: &[u8], chunk_index: u64) -> Vec<u8> {
    let aad = chunk_index.to_string();
    seal(key, plaintext, aad.as_bytes(), None)
}

/// Opens a chunk sealed by [`seal_chunk`], verifying `chunk_index` via AAD.
pub fn open_chunk(key: &FileKey, sealed: &[u8], chunk_index: u64) -> CoreResult<Vec<u8>> {
    let aad = chunk_index.to_string();
    open(key, sealed, aad.as_bytes(), None)
}

/// Seals a convergently-encrypted block: the nonce is deterministic
/// (`SHA-256("<hex_hash>_nonce")[0:12]`), so the same plaintext always
/// produces the same ciphertext and can be deduplicated post-encryption.
pub fn seal_convergent_block(key: &FileKey, plaintext: &[u8], hex_hash: &str) -> Vec<u8> {
    let nonce = convergent_nonce(hex_hash);
    seal(key, plaintext, &[], Some(nonce))
}

/// Opens a block sealed by [`seal_convergent_block`].
pub fn open_convergent_block(key: &FileKey, sealed: &[u8], hex_hash: &str) -> CoreResult<Vec<u8>> {
    let nonce = convergent_nonce(hex_hash);
    open(key, sealed, &[], Some(nonce))
}

fn convergent_nonce(hex_hash: &str) -> [u8; NONCE_SIZE] {
    let digest = Sha256::digest(format!("{hex_hash}_nonce").as_bytes());
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

fn seal(key: &FileKey, plaintext: &[u8], aad: &[u8], fixed_nonce: Option<[u8; NONCE_SIZE]>) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce_bytes = fixed_nonce.unwrap_or_else(|| {
        let mut n = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut n);
        n
    });
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .expect("encryption with a valid key and nonce cannot fail");

    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    out
}

fn open(
    key: &FileKey,
    sealed: &[u8],
    aad: &[u8],
    expected_nonce: Option<[u8; NONCE_SIZE]>,
) -> CoreResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(Error::Truncated.into());
    }
    let (nonce_bytes, ct) = sealed.split_at(NONCE_SIZE);

    if let Some(expected) = expected_nonce {
        if nonce_bytes != expected {
            return Err(Error::AeadFailure.into());
        }
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| Error::AeadFailure.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_file_key() {
        let master = MasterKey::from_secret("test-secret");
        let file_key = FileKey::generate();

        let wrapped = master.wrap(&file_key);
        let unwrapped = master.unwrap_key(&wrapped).unwrap();

        assert_eq!(file_key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_unwrap_rejects_tampered_ciphertext() {
        let master = MasterKey::from_secret("test-secret");
        let file_key = FileKey::generate();

        let mut wrapped = master.wrap(&file_key);
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xff;

        assert!(master.unwrap_key(&wrapped).is_err());
    }

    #[test]
    fn test_seal_open_whole_file_roundtrip() {
        let key = FileKey::generate();
        let plaintext = b"the quick brown fox jumps over the lazy dog";

        let sealed = seal_whole_file(&key, plaintext);
        let opened = open_whole_file(&key, &sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_seal_open_chunk_binds_index() {
        let key = FileKey::generate();
        let plaintext = b"chunk payload";

        let sealed = seal_chunk(&key, plaintext, 3);

        assert!(open_chunk(&key, &sealed, 3).is_ok());
        assert!(open_chunk(&key, &sealed, 4).is_err());
    }

    #[test]
    fn test_convergent_encryption_is_deterministic() {
        let content_hash = Sha256::digest(b"some file block").into();
        let key = FileKey::derive_convergent(&content_hash);
        let hex_hash = hex::encode(Sha256::digest(b"some file block"));

        let sealed_a = seal_convergent_block(&key, b"some file block", &hex_hash);
        let sealed_b = seal_convergent_block(&key, b"some file block", &hex_hash);

        assert_eq!(sealed_a, sealed_b);

        let opened = open_convergent_block(&key, &sealed_a, &hex_hash).unwrap();
        assert_eq!(opened, b"some file block");
    }

    #[test]
    fn test_convergent_key_derivation_is_deterministic() {
        let content_hash = Sha256::digest(b"identical content").into();
        let key_a = FileKey::derive_convergent(&content_hash);
        let key_b = FileKey::derive_convergent(&content_hash);

        assert_eq!(key_a.as_bytes(), key_b.as_bytes());
    }
}
