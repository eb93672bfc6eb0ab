//! Block storage.
//!
//! Every block is addressed purely by its content hash and current tier;
//! there is no separate "remote file" indirection layer, since unlike the
//! binary-cache model this store never needs to name a blob anything other
//! than its own hash.
//!
//! `single`-strategy files are the one exception: their bytes are sealed
//! under the upload session's own random `FileKey`, not a key derived from
//! content, so two different owners whose plaintext happens to match must
//! not land at the same storage address — doing so would let one clobber
//! or be silently skipped in favor of the other despite having distinct,
//! non-interchangeable ciphertext. [`single_object_key`] gives each such
//! file an address derived from its own row id instead of its content.

mod local;
mod s3;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::ServerResult;
use vault_core::hash::ContentHash;

/// Storage address for a `single`-strategy file's one object, derived from
/// the file's own id rather than its content hash.
///
/// `put_block`'s create-if-absent semantics assume the hash uniquely
/// determines the plaintext; that only holds for convergently-encrypted
/// blocks. A `single` file's ciphertext depends on its own random key, so
/// sharing a content-addressed slot with another owner's upload of the same
/// plaintext would let one file's bytes silently stand in for the other's,
/// and deleting either would destroy both. Keying by file id instead makes
/// every `single` object's address unique to that file, which also makes
/// `put_block`'s "already present" branch unreachable for this path and
/// `delete_block` safe to call unconditionally from a single owner.
pub fn single_object_key(file_id: Uuid) -> ContentHash {
    ContentHash::sha256_from_bytes(file_id.as_bytes())
}

pub(crate) use self::local::{LocalBackend, LocalStorageConfig};
pub(crate) use self::s3::{S3Backend, S3StorageConfig};

/// Coarse access-latency class a block currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Recently written or accessed.
    Cache,

    /// Not accessed in 30+ days.
    Warm,

    /// Not accessed in 90+ days.
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }

    /// The tier a block moves to after exceeding `age_days` without access,
    /// if any.
    pub fn next(&self, age_days: i64) -> Option<Self> {
        match self {
            Self::Cache if age_days > 30 => Some(Self::Warm),
            Self::Warm if age_days > 90 => Some(Self::Cold),
            _ => None,
        }
    }
}

/// Way to download a block.
///
/// Always a stream, never a redirect: blocks are encrypted at rest and the
/// server must read the raw bytes itself to decrypt them before any
/// plaintext reaches a client.
pub enum Download {
    Stream(Box<dyn AsyncRead + Unpin + Send>),
}

/// A storage backend for content-addressed blocks.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Writes a block's raw bytes under `tier`, if not already present.
    ///
    /// Implementations must make this a `create-if-absent` race: concurrent
    /// writers of the same hash should not corrupt each other, and the
    /// loser of the race is a no-op, not an error.
    async fn put_block(
        &self,
        tier: Tier,
        hash: &ContentHash,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()>;

    /// Returns whether a block exists in the given tier.
    async fn block_exists(&self, tier: Tier, hash: &ContentHash) -> ServerResult<bool>;

    /// Reads a block's raw bytes from the given tier.
    async fn get_block(&self, tier: Tier, hash: &ContentHash) -> ServerResult<Download>;

    /// Deletes a block from a tier. Remove-if-present: missing files are not
    /// an error, since GC's unlink step may race a concurrent rematerialize.
    async fn delete_block(&self, tier: Tier, hash: &ContentHash) -> ServerResult<()>;

    /// Moves a block's bytes from one tier to another.
    ///
    /// Implementations should do this atomically at the filesystem level
    /// (rename where possible, copy-then-unlink otherwise).
    async fn move_block(&self, hash: &ContentHash, from: Tier, to: Tier) -> ServerResult<()>;
}
