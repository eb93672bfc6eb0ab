//! Shared test harness.
//!
//! Builds a fully wired `State` against a throwaway sqlite database and
//! local storage directory, and provides helpers for driving upload
//! sessions through the completion pipeline without going through the HTTP
//! layer or session cache. Mirrors the role `vault_core::testing` plays for
//! the core crate's own tests.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use uuid::Uuid;

use crate::database::migration::{Migrator, MigratorTrait};
use crate::ingest;
use crate::session::{AcceptedChunk, Strategy, UploadSession};
use crate::{State, StateInner};
use vault_core::crypto::{self, FileKey, MasterKey};
use vault_core::hash::ContentHash;

/// Builds a config pointed at a fresh sqlite file and local storage
/// directory under the OS temp dir, with chunking thresholds small enough
/// to exercise multi-block behavior against in-memory-sized fixtures.
fn test_config() -> (crate::config::Config, PathBuf) {
    let run_id = Uuid::new_v4().as_simple().to_string();
    let db_path = std::env::temp_dir().join(format!("vault-test-{run_id}.sqlite3"));
    let storage_dir = std::env::temp_dir().join(format!("vault-test-storage-{run_id}"));

    let toml = format!(
        r#"
cross-user-dedup = false

[database]
url = "sqlite://{db}?mode=rwc"

[storage]
type = "local"
path = "{storage}"

[session-cache]
type = "memory"

[chunking]
inline-threshold = 64
single-object-threshold = 8192
chunk-size = 4096
min-block-size = 256
avg-block-size = 4096
max-block-size = 4096

[encryption]

[jwt]
"#,
        db = db_path.display(),
        storage = storage_dir.display(),
    );

    let config = toml::from_str(&toml).expect("test config must parse");
    (config, storage_dir)
}

/// Builds a ready-to-use `State` with migrations already applied, plus the
/// directory its local storage backend writes under.
pub(crate) async fn test_state() -> (State, PathBuf) {
    let (config, storage_dir) = test_config();
    let state = StateInner::new(config).await;
    let db = state.database().await.expect("test database must connect");
    Migrator::up(db, None).await.expect("test migrations must apply");
    (state, storage_dir)
}

/// Builds an `inline`-strategy session with `plaintext` already sealed.
pub(crate) fn inline_session(
    owner: Uuid,
    file_name: &str,
    plaintext: &[u8],
    file_key: &FileKey,
    master_key: &MasterKey,
) -> UploadSession {
    let sealed = crypto::seal_whole_file(file_key, plaintext);

    UploadSession {
        id: Uuid::new_v4(),
        owner,
        file_name: file_name.to_owned(),
        folder_id: None,
        declared_size: plaintext.len() as u64,
        strategy: Strategy::Inline,
        chunk_size: (plaintext.len() as u64).max(1),
        expected_chunk_count: 0,
        received_indices: Default::default(),
        chunk_block_hashes: Vec::new(),
        wrapped_file_key: master_key.wrap(file_key),
        compress: false,
        inline_payload: Some(BASE64_STANDARD.encode(sealed)),
        single_object_path: None,
        whole_file_payload_hash: Some(ContentHash::sha256_from_bytes(plaintext).to_typed_hex()),
        start_time: Utc::now(),
    }
}

/// Builds a `single`-strategy session, sealing `plaintext` into a temp
/// frame the way `accept_direct` would before completion moves it into
/// content-addressed storage.
pub(crate) async fn single_session(
    owner: Uuid,
    file_name: &str,
    plaintext: &[u8],
    file_key: &FileKey,
    master_key: &MasterKey,
) -> UploadSession {
    let session_id = Uuid::new_v4();
    ingest::ensure_frame_dir(session_id).await.expect("frame dir must be creatable");

    let sealed = crypto::seal_whole_file(file_key, plaintext);
    let path = ingest::single_frame_path(session_id);
    tokio::fs::write(&path, &sealed).await.expect("sealed frame must be writable");

    UploadSession {
        id: session_id,
        owner,
        file_name: file_name.to_owned(),
        folder_id: None,
        declared_size: plaintext.len() as u64,
        strategy: Strategy::Single,
        chunk_size: (plaintext.len() as u64).max(1),
        expected_chunk_count: 0,
        received_indices: Default::default(),
        chunk_block_hashes: Vec::new(),
        wrapped_file_key: master_key.wrap(file_key),
        compress: false,
        inline_payload: None,
        single_object_path: Some(path.to_string_lossy().into_owned()),
        whole_file_payload_hash: Some(ContentHash::sha256_from_bytes(plaintext).to_typed_hex()),
        start_time: Utc::now(),
    }
}

/// Builds a `chunked`-strategy session out of `parts`, accepting only the
/// indices listed in `received` — the rest are left missing, for
/// resume/missing-index tests. Use [`accept_chunk_into`] to fill in the
/// rest later.
pub(crate) async fn chunked_session_parts(
    owner: Uuid,
    file_name: &str,
    parts: &[&[u8]],
    received: &[u32],
    file_key: &FileKey,
    master_key: &MasterKey,
) -> UploadSession {
    let session_id = Uuid::new_v4();
    ingest::ensure_frame_dir(session_id).await.expect("frame dir must be creatable");

    let declared_size: u64 = parts.iter().map(|p| p.len() as u64).sum();
    let mut session = UploadSession {
        id: session_id,
        owner,
        file_name: file_name.to_owned(),
        folder_id: None,
        declared_size,
        strategy: Strategy::Chunked,
        chunk_size: parts.first().map(|p| p.len() as u64).unwrap_or(1).max(1),
        expected_chunk_count: parts.len() as u32,
        received_indices: Default::default(),
        chunk_block_hashes: vec![None; parts.len()],
        wrapped_file_key: master_key.wrap(file_key),
        compress: false,
        inline_payload: None,
        single_object_path: None,
        whole_file_payload_hash: None,
        start_time: Utc::now(),
    };

    for &index in received {
        accept_chunk_into(&mut session, index, parts[index as usize], file_key).await;
    }

    session
}

/// Seals `plaintext` as chunk `index` into `session`, writing its frame and
/// marking the index received — the same effect `accept_chunk` has on a
/// cached session, without the HTTP handler or session cache.
pub(crate) async fn accept_chunk_into(session: &mut UploadSession, index: u32, plaintext: &[u8], file_key: &FileKey) {
    let sealed = crypto::seal_chunk(file_key, plaintext, index as u64);
    let path = ingest::chunk_frame_path(session.id, index);
    tokio::fs::write(&path, &sealed).await.expect("sealed frame must be writable");

    session.chunk_block_hashes[index as usize] = Some(AcceptedChunk {
        content_hash: ContentHash::sha256_from_bytes(plaintext).to_typed_hex(),
        size: plaintext.len() as u64,
        frame_path: path.to_string_lossy().into_owned(),
    });
    session.received_indices.insert(index);
}

/// Drains a reconstructed download stream into a single buffer.
pub(crate) async fn collect_stream(mut stream: BoxStream<'static, std::io::Result<Bytes>>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.expect("reconstructed stream must not fail"));
    }
    out
}

/// The on-disk path a `single`-strategy file's one object lives at under
/// `storage_dir`'s cache tier, mirroring `LocalBackend::get_path`.
pub(crate) fn single_object_disk_path(storage_dir: &Path, file_id: Uuid) -> PathBuf {
    let key = crate::storage::single_object_key(file_id);
    storage_dir.join("cache").join(key.shard_prefix(2)).join(key.to_hex())
}

/// Flips the last byte of a file on disk, simulating storage-level bit rot
/// for integrity-failure tests.
pub(crate) async fn corrupt_last_byte(path: &Path) {
    let mut bytes = tokio::fs::read(path).await.expect("file to corrupt must exist");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    tokio::fs::write(path, &bytes).await.expect("corrupted file must be writable");
}
