//! Completion pipeline: reassembles an upload session's accepted bytes,
//! runs full-file and block-level deduplication, and writes the resulting
//! `file` (and, for `chunked`, `block`/`block_ref`) rows.
//!
//! Session frames never touch the content-addressed storage backend while
//! an upload is in flight — they're plain encrypted files under the OS
//! temp directory, sharded by the first two hex characters of the session
//! id, exactly as ephemeral per-session state that the `StorageBackend`
//! trait (tier + content hash only) has no vocabulary for.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_compression::tokio::bufread::ZstdDecoder;
use async_stream::try_stream;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, Query};
use sea_orm::{ActiveValue::Set, ConnectionTrait, DatabaseConnection, TransactionTrait};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::database::entity::block::{self, Entity as Block};
use crate::database::entity::block_ref;
use crate::database::entity::file::{self, DedupInfo, Entity as File, FileModel, ManifestEntry, StorageTier, StorageType};
use crate::database::entity::Json;
use crate::database::VaultDatabase;
use crate::error::{ServerError, ServerResult};
use crate::session::{Strategy, UploadSession};
use crate::storage::{StorageBackend, Tier};
use crate::State;
use vault_core::crypto::{self, FileKey, MasterKey};
use vault_core::hash::ContentHash;
use vault_core::io::HashReader;
use vault_core::util::Finally;
use vault_core::{chunking, mime};

/// Base directory for in-flight session frames.
fn frame_root() -> PathBuf {
    std::env::temp_dir().join("vault-upload-frames")
}

fn session_frame_dir(session_id: Uuid) -> PathBuf {
    let simple = session_id.as_simple().to_string();
    frame_root().join(&simple[..2]).join(simple)
}

/// Path a `chunked`-strategy frame for `index` should be written to.
pub fn chunk_frame_path(session_id: Uuid, index: u32) -> PathBuf {
    session_frame_dir(session_id).join(format!("{index}.frame"))
}

/// Path the single sealed blob of an `inline`/`single` direct upload should
/// be written to before completion moves or inlines it.
pub fn single_frame_path(session_id: Uuid) -> PathBuf {
    session_frame_dir(session_id).join("whole.frame")
}

/// Creates the sharded parent directory for a session's frames.
pub async fn ensure_frame_dir(session_id: Uuid) -> std::io::Result<()> {
    tokio::fs::create_dir_all(session_frame_dir(session_id)).await
}

/// Removes every temp frame belonging to a session. Best-effort: a session
/// that never wrote any frames (pure inline, already inlined) has nothing
/// to clean up, and a missing directory is not an error.
pub async fn cleanup_session_frames(session_id: Uuid) {
    let _ = tokio::fs::remove_dir_all(session_frame_dir(session_id)).await;
}

/// Outcome of a successful `/upload/complete` call.
pub struct CompletionOutcome {
    pub file_id: Uuid,
    pub status: &'static str,
    pub logical_size: u64,
    pub saved_size: u64,
}

impl CompletionOutcome {
    fn stored(file_id: Uuid, logical_size: u64, saved_size: u64) -> Self {
        Self {
            file_id,
            status: "stored",
            logical_size,
            saved_size,
        }
    }

    fn full_duplicate(file_id: Uuid, size: u64) -> Self {
        Self {
            file_id,
            status: "full_duplicate",
            logical_size: size,
            saved_size: size,
        }
    }

    /// Percentage of the logical size that didn't need new bytes written.
    pub fn dedup_ratio(&self) -> f64 {
        if self.logical_size == 0 {
            0.0
        } else {
            (self.saved_size as f64 / self.logical_size as f64) * 100.0
        }
    }
}

/// Finalizes a session: reassembles its plaintext, deduplicates it against
/// existing files and blocks, and writes the resulting metadata row(s).
pub async fn complete_session(state: &State, session: &UploadSession) -> ServerResult<CompletionOutcome> {
    let master_key = state.config.encryption.master_key()?;
    let file_key = session.file_key(&master_key)?;
    let db = state.database().await?;
    let storage = state.storage().await?;

    match session.strategy {
        Strategy::Inline | Strategy::Single => {
            complete_whole(state, db, storage, session, &file_key, &master_key).await
        }
        Strategy::Chunked => complete_chunked(state, db, storage, session, &file_key, &master_key).await,
    }
}

async fn complete_whole(
    state: &State,
    db: &DatabaseConnection,
    storage: &Arc<Box<dyn StorageBackend>>,
    session: &UploadSession,
    file_key: &FileKey,
    master_key: &MasterKey,
) -> ServerResult<CompletionOutcome> {
    let typed_hash = session
        .whole_file_payload_hash
        .clone()
        .ok_or_else(|| ServerError::Validation("no payload received for this session".into()))?;

    if let Some(target) = db
        .find_file_by_content_hash(&typed_hash, session.owner, state.config.cross_user_dedup)
        .await?
    {
        let file = insert_dedup_reference(db, session, &target).await?;
        return Ok(CompletionOutcome::full_duplicate(file.id, file.size as u64));
    }

    let file_id = Uuid::new_v4();

    let (inline_payload, storage_type) = match session.strategy {
        Strategy::Inline => {
            let payload = session
                .inline_payload
                .clone()
                .ok_or_else(|| ServerError::Validation("no inline payload recorded".into()))?;
            (Some(payload), StorageType::Inline)
        }
        Strategy::Single => {
            // Keyed by file id, not content hash: the payload is sealed
            // under this session's own random key, so it must not share a
            // storage address with another owner's upload of the same
            // plaintext. See `storage::single_object_key`.
            let storage_key = crate::storage::single_object_key(file_id);
            let path = session
                .single_object_path
                .clone()
                .ok_or_else(|| ServerError::Validation("no single-object payload recorded".into()))?;
            let mut frame = tokio::fs::File::open(&path).await.map_err(ServerError::storage_io)?;
            storage.put_block(Tier::Cache, &storage_key, &mut frame).await?;
            (None, StorageType::Single)
        }
        Strategy::Chunked => unreachable!("dispatched separately"),
    };

    let active = file::ActiveModel {
        id: Set(file_id),
        owner: Set(session.owner),
        folder_id: Set(session.folder_id),
        name: Set(session.file_name.clone()),
        size: Set(session.declared_size as i64),
        content_hash: Set(Some(typed_hash)),
        mime: Set(mime::guess_from_filename(&session.file_name).to_owned()),
        storage_type: Set(storage_type),
        placement_tier: Set(StorageTier::Cache),
        encryption_envelope: Set(BASE64_STANDARD.encode(master_key.wrap(file_key))),
        inline_payload: Set(inline_payload),
        chunk_manifest: Set(Json(Vec::new())),
        dedup_info: Set(Json(DedupInfo {
            logical_size: session.declared_size,
            saved_size: 0,
            convergent_encryption: false,
            compressed: session.compress,
        })),
        dedup_target: Set(None),
        created_at: Set(Utc::now()),
        last_accessed: Set(None),
    };
    let file = active.insert(db).await?;

    cleanup_session_frames(session.id).await;
    Ok(CompletionOutcome::stored(file.id, session.declared_size, 0))
}

async fn complete_chunked(
    state: &State,
    db: &DatabaseConnection,
    storage: &Arc<Box<dyn StorageBackend>>,
    session: &UploadSession,
    file_key: &FileKey,
    master_key: &MasterKey,
) -> ServerResult<CompletionOutcome> {
    if !session.is_complete() {
        return Err(ServerError::Validation(format!(
            "upload incomplete, missing chunks: {:?}",
            session.missing_indices()
        )));
    }

    let cross_user_dedup = state.config.cross_user_dedup;

    // Pass 1: hash the reassembled plaintext without writing anything, so a
    // full-file dedup hit never costs a single block write.
    let reader = StreamReader::new(Box::pin(reconstruct_plaintext_stream(session.clone(), file_key.clone())));
    let (mut hashing, finalized) = HashReader::new(reader, Sha256::new());
    tokio::io::copy(&mut hashing, &mut tokio::io::sink())
        .await
        .map_err(ServerError::storage_io)?;
    let (digest, _len) = finalized.get().cloned().expect("stream reached EOF, hash must be finalized");
    let digest_bytes: [u8; 32] = digest.as_slice().try_into().expect("SHA-256 digest is 32 bytes");
    let content_hash = ContentHash::Sha256(digest_bytes);
    let typed_hash = content_hash.to_typed_hex();

    if let Some(target) = db.find_file_by_content_hash(&typed_hash, session.owner, cross_user_dedup).await? {
        let file = insert_dedup_reference(db, session, &target).await?;
        return Ok(CompletionOutcome::full_duplicate(file.id, file.size as u64));
    }

    // Pass 2: re-chunk and deduplicate at the block level.
    let reader = StreamReader::new(Box::pin(reconstruct_plaintext_stream(session.clone(), file_key.clone())));
    let mut blocks = Box::pin(chunking::chunk_stream(
        reader,
        state.config.chunking.min_block_size,
        state.config.chunking.avg_block_size,
        state.config.chunking.max_block_size,
    ));

    let created_hashes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let rollback_hashes = created_hashes.clone();
    let rollback_db = db.clone();
    let cleanup = Finally::new(async move {
        let hashes = rollback_hashes.lock().unwrap().clone();
        for hash in hashes {
            let _ = decrement_block_refcount(&rollback_db, &hash).await;
        }
    });

    let mut manifest = Vec::new();
    let mut offset: u64 = 0;
    let mut saved_size: u64 = 0;

    while let Some(block) = blocks.next().await {
        let block = block.map_err(ServerError::storage_io)?;
        let block_hash = ContentHash::sha256_from_bytes(&block);
        let hex_hash = block_hash.to_hex();
        let typed_block_hash = block_hash.to_typed_hex();

        let (_, created) = db
            .find_or_create_block(&typed_block_hash, block.len() as u64, session.owner, cross_user_dedup)
            .await?;

        if created {
            created_hashes.lock().unwrap().push(typed_block_hash.clone());

            let block_key = FileKey::derive_convergent(block_hash.raw_bytes());
            let sealed = crypto::seal_convergent_block(&block_key, &block, &hex_hash);
            storage.put_block(Tier::Cache, &block_hash, &mut Cursor::new(sealed)).await?;
            db.mark_block_valid(&typed_block_hash).await?;
        } else {
            saved_size += block.len() as u64;
        }

        manifest.push(ManifestEntry {
            hash: typed_block_hash,
            size: block.len() as u64,
            offset,
            duplicate: !created,
        });
        offset += block.len() as u64;
    }

    let logical_size = offset;
    let file_id = Uuid::new_v4();

    let txn = db.begin().await?;

    let active = file::ActiveModel {
        id: Set(file_id),
        owner: Set(session.owner),
        folder_id: Set(session.folder_id),
        name: Set(session.file_name.clone()),
        size: Set(logical_size as i64),
        content_hash: Set(Some(typed_hash)),
        mime: Set(mime::guess_from_filename(&session.file_name).to_owned()),
        storage_type: Set(StorageType::Chunked),
        placement_tier: Set(StorageTier::Cache),
        encryption_envelope: Set(BASE64_STANDARD.encode(master_key.wrap(file_key))),
        inline_payload: Set(None),
        chunk_manifest: Set(Json(manifest.clone())),
        dedup_info: Set(Json(DedupInfo {
            logical_size,
            saved_size,
            convergent_encryption: true,
            compressed: session.compress,
        })),
        dedup_target: Set(None),
        created_at: Set(Utc::now()),
        last_accessed: Set(None),
    };
    let file = active.insert(&txn).await?;

    for (seq, entry) in manifest.iter().enumerate() {
        let block_ref_active = block_ref::ActiveModel {
            file_id: Set(file.id),
            seq: Set(seq as i32),
            block_hash: Set(entry.hash.clone()),
            ..Default::default()
        };
        block_ref_active.insert(&txn).await?;
    }

    txn.commit().await?;
    cleanup.cancel();

    cleanup_session_frames(session.id).await;
    Ok(CompletionOutcome::stored(file.id, logical_size, saved_size))
}

async fn insert_dedup_reference(
    db: &DatabaseConnection,
    session: &UploadSession,
    target: &FileModel,
) -> ServerResult<FileModel> {
    let file_id = Uuid::new_v4();
    let active = file::ActiveModel {
        id: Set(file_id),
        owner: Set(session.owner),
        folder_id: Set(session.folder_id),
        name: Set(session.file_name.clone()),
        size: Set(target.size),
        content_hash: Set(target.content_hash.clone()),
        mime: Set(target.mime.clone()),
        storage_type: Set(StorageType::DeduplicatedReference),
        placement_tier: Set(target.placement_tier),
        encryption_envelope: Set(target.encryption_envelope.clone()),
        inline_payload: Set(None),
        chunk_manifest: Set(Json(Vec::new())),
        dedup_info: Set(Json(DedupInfo {
            logical_size: target.size as u64,
            saved_size: target.size as u64,
            convergent_encryption: false,
            compressed: false,
        })),
        dedup_target: Set(Some(target.id)),
        created_at: Set(Utc::now()),
        last_accessed: Set(None),
    };
    let file = active.insert(db).await?;
    cleanup_session_frames(session.id).await;
    Ok(file)
}

async fn decrement_block_refcount(db: &DatabaseConnection, content_hash: &str) -> ServerResult<()> {
    let decrement = Query::update()
        .table(Block)
        .value(
            block::Column::ReferenceCount,
            Expr::col(block::Column::ReferenceCount).sub(1),
        )
        .and_where(block::Column::ContentHash.eq(content_hash.to_owned()))
        .to_owned();
    let stmt = db.get_database_backend().build(&decrement);
    db.execute(stmt).await?;
    Ok(())
}

/// Streams a session's plaintext back in manifest order: open each accepted
/// chunk's temp frame, verify+open its AEAD seal, decompress if the session
/// compressed it, and yield the plaintext.
fn reconstruct_plaintext_stream(session: UploadSession, file_key: FileKey) -> impl Stream<Item = std::io::Result<Bytes>> {
    try_stream! {
        for index in 0..session.expected_chunk_count {
            let accepted = session.chunk_block_hashes[index as usize]
                .as_ref()
                .expect("is_complete() guarantees every index up to expected_chunk_count is present");

            let sealed = tokio::fs::read(&accepted.frame_path).await?;
            let compressed = crypto::open_chunk(&file_key, &sealed, index as u64)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

            let plaintext = if session.compress {
                let mut decoder = ZstdDecoder::new(BufReader::new(&compressed[..]));
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).await?;
                out
            } else {
                compressed
            };

            yield Bytes::from(plaintext);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_upload_roundtrips_through_download() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        let plaintext = b"hello, inline world".to_vec();
        let file_key = FileKey::generate();
        let session = crate::testing::inline_session(owner, "hello.txt", &plaintext, &file_key, &master_key);

        let outcome = complete_session(&state, &session).await.unwrap();
        assert_eq!(outcome.status, "stored");
        assert_eq!(outcome.logical_size, plaintext.len() as u64);

        let file = File::find_by_id(outcome.file_id).one(db).await.unwrap().unwrap();
        assert_eq!(file.storage_type, StorageType::Inline);

        let reconstruction = crate::download::open_file(&state, &file, None).await.unwrap();
        let bytes = crate::testing::collect_stream(reconstruction.stream).await;
        assert_eq!(bytes, plaintext);
    }

    #[tokio::test]
    async fn chunked_session_tracks_missing_indices_until_resumed() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        state.database().await.unwrap().get_or_create_user(owner).await.unwrap();

        let file_key = FileKey::generate();
        let part0 = b"part-zero-".repeat(10);
        let part1 = b"part-one--".repeat(10);
        let part2 = b"part-two--".repeat(10);
        let parts = [part0.as_slice(), part1.as_slice(), part2.as_slice()];

        let mut session =
            crate::testing::chunked_session_parts(owner, "resume.bin", &parts, &[0, 2], &file_key, &master_key).await;
        assert!(!session.is_complete());
        assert_eq!(session.missing_indices(), vec![1]);

        crate::testing::accept_chunk_into(&mut session, 1, &part1, &file_key).await;
        assert!(session.is_complete());
        assert!(session.missing_indices().is_empty());

        let outcome = complete_session(&state, &session).await.unwrap();
        assert_eq!(outcome.status, "stored");
        assert_eq!(outcome.logical_size, (part0.len() + part1.len() + part2.len()) as u64);
    }

    #[tokio::test]
    async fn single_strategy_storage_is_scoped_per_file_not_shared_by_content() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();

        let owner_a = Uuid::new_v4();
        let owner_b = Uuid::new_v4();
        db.get_or_create_user(owner_a).await.unwrap();
        db.get_or_create_user(owner_b).await.unwrap();

        // Both owners upload the exact same plaintext, large enough that
        // production thresholds would route it through the `single`
        // strategy rather than inlining it.
        let plaintext = vec![9u8; 4096];

        let key_a = FileKey::generate();
        let session_a = crate::testing::single_session(owner_a, "a.bin", &plaintext, &key_a, &master_key).await;
        let outcome_a = complete_session(&state, &session_a).await.unwrap();
        assert_eq!(outcome_a.status, "stored");

        let key_b = FileKey::generate();
        let session_b = crate::testing::single_session(owner_b, "b.bin", &plaintext, &key_b, &master_key).await;
        let outcome_b = complete_session(&state, &session_b).await.unwrap();
        assert_eq!(outcome_b.status, "stored");
        assert_ne!(outcome_a.file_id, outcome_b.file_id);

        let file_a = File::find_by_id(outcome_a.file_id).one(db).await.unwrap().unwrap();
        let file_b = File::find_by_id(outcome_b.file_id).one(db).await.unwrap().unwrap();

        let reconstructed_a =
            crate::testing::collect_stream(crate::download::open_file(&state, &file_a, None).await.unwrap().stream)
                .await;
        let reconstructed_b =
            crate::testing::collect_stream(crate::download::open_file(&state, &file_b, None).await.unwrap().stream)
                .await;

        assert_eq!(reconstructed_a, plaintext);
        assert_eq!(reconstructed_b, plaintext);
    }

    #[tokio::test]
    async fn full_file_dedup_marks_second_identical_upload_as_duplicate() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        let plaintext = vec![77u8; 4096];

        let key_first = FileKey::generate();
        let session_first = crate::testing::single_session(owner, "first.bin", &plaintext, &key_first, &master_key).await;
        let outcome_first = complete_session(&state, &session_first).await.unwrap();
        assert_eq!(outcome_first.status, "stored");

        let key_second = FileKey::generate();
        let session_second =
            crate::testing::single_session(owner, "second.bin", &plaintext, &key_second, &master_key).await;
        let outcome_second = complete_session(&state, &session_second).await.unwrap();

        assert_eq!(outcome_second.status, "full_duplicate");
        assert_eq!(outcome_second.dedup_ratio(), 100.0);

        let reference = File::find_by_id(outcome_second.file_id).one(db).await.unwrap().unwrap();
        assert_eq!(reference.storage_type, StorageType::DeduplicatedReference);
        assert_eq!(reference.dedup_target, Some(outcome_first.file_id));
    }

    #[tokio::test]
    async fn chunked_partial_dedup_shares_leading_blocks_with_prior_upload() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        // `max-block-size` is 4096 bytes in the test config; content-defined
        // cuts are a pure function of bytes already consumed in the current
        // buffer, so an identical byte prefix between two uploads produces
        // identical interior chunk boundaries. Divergence is only possible
        // once the content actually differs.
        let shared_prefix = vault_core::testing::get_fake_data(64 * 1024);
        let mut file_b_payload = shared_prefix.clone();
        file_b_payload.extend(vault_core::testing::get_fake_data(4096));

        let key_a = FileKey::generate();
        let session_a = crate::testing::chunked_session_parts(
            owner,
            "a.bin",
            &[shared_prefix.as_slice()],
            &[0],
            &key_a,
            &master_key,
        )
        .await;
        let outcome_a = complete_session(&state, &session_a).await.unwrap();
        assert_eq!(outcome_a.status, "stored");
        assert_eq!(outcome_a.saved_size, 0);

        let key_b = FileKey::generate();
        let session_b = crate::testing::chunked_session_parts(
            owner,
            "b.bin",
            &[file_b_payload.as_slice()],
            &[0],
            &key_b,
            &master_key,
        )
        .await;
        let outcome_b = complete_session(&state, &session_b).await.unwrap();

        assert_eq!(outcome_b.status, "stored");
        assert!(outcome_b.saved_size > 0, "B's shared prefix should hit A's already-written blocks");
        assert!(
            outcome_b.saved_size < outcome_b.logical_size,
            "B's new tail bytes still need fresh blocks written"
        );

        let file_a = File::find_by_id(outcome_a.file_id).one(db).await.unwrap().unwrap();
        let file_b = File::find_by_id(outcome_b.file_id).one(db).await.unwrap().unwrap();
        let hashes_a: std::collections::HashSet<_> = file_a.chunk_manifest.0.iter().map(|e| e.hash.clone()).collect();
        let shared_hashes = file_b.chunk_manifest.0.iter().filter(|e| hashes_a.contains(&e.hash)).count();
        assert!(shared_hashes > 0, "B's manifest should reuse at least one of A's block hashes");
    }
}
