//! Upload session cache.
//!
//! Sessions are volatile: everything they hold can be reconstructed from
//! the Metadata Store plus whatever temporary frames already landed on
//! disk, so losing the cache only costs in-flight uploads, not durability.

mod memory;
mod redis;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionCacheConfig;
use crate::error::ServerResult;
use vault_core::crypto::FileKey;

pub use self::memory::MemorySessionCache;
pub use self::redis::RedisSessionCache;

/// How long a session may sit idle before it is considered abandoned.
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

/// The storage strategy chosen for an upload, based on its declared size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Payload small enough to live inline in metadata.
    Inline,

    /// Payload stored as a single encrypted object, not content-defined chunked.
    Single,

    /// Payload re-chunked and deduplicated at the block level.
    Chunked,
}

impl Strategy {
    /// Chooses a strategy for a declared upload size.
    pub fn for_size(declared_size: u64, inline_threshold: u64, single_object_threshold: u64) -> Self {
        if declared_size < inline_threshold {
            Self::Inline
        } else if declared_size < single_object_threshold {
            Self::Single
        } else {
            Self::Chunked
        }
    }
}

/// A chunk accepted into a `chunked`-strategy session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedChunk {
    /// SHA-256 of the original (pre-compression, pre-encryption) bytes.
    pub content_hash: String,

    /// Size of the original bytes.
    pub size: u64,

    /// Path to the encrypted temporary frame under the cache tier.
    pub frame_path: String,
}

/// An in-progress upload, keyed by a random session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub owner: Uuid,
    pub file_name: String,
    pub folder_id: Option<Uuid>,
    pub declared_size: u64,
    pub strategy: Strategy,
    pub chunk_size: u64,
    pub expected_chunk_count: u32,
    pub received_indices: BTreeSet<u32>,
    pub chunk_block_hashes: Vec<Option<AcceptedChunk>>,
    pub wrapped_file_key: Vec<u8>,
    pub compress: bool,
    pub inline_payload: Option<String>,
    pub single_object_path: Option<String>,

    /// SHA-256 of the whole-file plaintext, typed (`sha256:<hex>`).
    ///
    /// Set by `accept_direct` for `inline`/`single` sessions, where the
    /// whole payload passes through the handler in one shot and the hash
    /// is free to keep. `chunked` sessions only learn this at completion
    /// time, after CDC re-chunking sees the reassembled plaintext.
    pub whole_file_payload_hash: Option<String>,

    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl UploadSession {
    /// Recovers the session's file key by unwrapping it under the master key.
    pub fn file_key(&self, master_key: &vault_core::crypto::MasterKey) -> ServerResult<FileKey> {
        Ok(master_key.unwrap_key(&self.wrapped_file_key)?)
    }

    /// Whether every expected chunk index has been accepted.
    pub fn is_complete(&self) -> bool {
        self.received_indices.len() == self.expected_chunk_count as usize
    }

    /// Indices still missing, in ascending order.
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.expected_chunk_count)
            .filter(|i| !self.received_indices.contains(i))
            .collect()
    }
}

/// A cache for in-progress upload sessions.
///
/// Implementations must treat `put` as a refresh of the TTL: every
/// successful mutation of a session (init, accept_chunk, accept_direct)
/// re-extends its expiry window.
#[async_trait::async_trait]
pub trait SessionCache: Send + Sync + std::fmt::Debug {
    async fn get(&self, id: Uuid) -> ServerResult<Option<UploadSession>>;

    async fn put(&self, session: &UploadSession) -> ServerResult<()>;

    async fn delete(&self, id: Uuid) -> ServerResult<()>;
}

/// Builds the configured session cache backend.
pub async fn build(config: &SessionCacheConfig) -> ServerResult<Arc<dyn SessionCache>> {
    match config {
        SessionCacheConfig::Memory => Ok(Arc::new(MemorySessionCache::new())),
        SessionCacheConfig::Redis { url } => {
            let cache = RedisSessionCache::new(url).await?;
            Ok(Arc::new(cache))
        }
    }
}
