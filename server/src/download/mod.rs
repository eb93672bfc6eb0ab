//! Range-aware reconstruction of stored files.
//!
//! Every storage type ends in the same place: a byte stream the caller can
//! slice to the requested range. `inline` and `single` payloads are small
//! enough (by construction — see the placement thresholds) to decrypt and
//! decompress wholesale; `chunked` files are walked block by block so a
//! range request doesn't have to touch bytes outside it.

use async_compression::tokio::bufread::ZstdDecoder;
use async_stream::try_stream;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use sea_orm::EntityTrait;
use tokio::io::{AsyncReadExt, BufReader};

use crate::database::entity::file::{FileModel, StorageTier, StorageType};
use crate::error::{ServerError, ServerResult};
use crate::State;
use vault_core::crypto::{self, FileKey, MasterKey};
use vault_core::hash::ContentHash;

/// An inclusive byte range, already validated against the file's size.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a `Range: bytes=a-b` / `bytes=-suffix` header.
///
/// Returns `Ok(None)` for no/unparseable header (treated as a full read,
/// matching the common browser-compatible behavior of ignoring a
/// malformed Range rather than rejecting the request), and
/// `RangeUnsatisfiable` when the range is well-formed but out of bounds.
pub fn parse_range(header: Option<&str>, total_size: u64) -> ServerResult<Option<ByteRange>> {
    let Some(header) = header else {
        return Ok(None);
    };

    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return Ok(None);
    };

    let range = if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().map_err(|_| ServerError::RangeUnsatisfiable { total_size })?;
        if suffix_len == 0 || total_size == 0 {
            return Err(ServerError::RangeUnsatisfiable { total_size });
        }
        let start = total_size.saturating_sub(suffix_len);
        ByteRange { start, end: total_size - 1 }
    } else {
        let start: u64 = start_str.parse().map_err(|_| ServerError::RangeUnsatisfiable { total_size })?;
        let end: u64 = if end_str.is_empty() {
            total_size.saturating_sub(1)
        } else {
            end_str.parse().map_err(|_| ServerError::RangeUnsatisfiable { total_size })?
        };
        ByteRange { start, end }
    };

    if range.start > range.end || range.end >= total_size.max(1) || total_size == 0 {
        return Err(ServerError::RangeUnsatisfiable { total_size });
    }

    Ok(Some(range))
}

/// A reconstructed, range-sliced plaintext stream ready to hand to the
/// HTTP layer.
pub struct Reconstruction {
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    pub range: Option<ByteRange>,
}

/// Reconstructs a file's plaintext, sliced to `range` if given.
///
/// A `deduplicated_reference` row carries no bytes of its own; resolve it
/// to the file it aliases before doing any real work. The target is never
/// itself a reference (full-file dedup always points at the original),
/// so one hop is enough.
pub async fn open_file(state: &State, file: &FileModel, range: Option<ByteRange>) -> ServerResult<Reconstruction> {
    if file.storage_type == StorageType::DeduplicatedReference {
        let target_id = file.dedup_target.ok_or(ServerError::NotFound)?;
        let db = state.database().await?;
        let target = crate::database::entity::file::Entity::find_by_id(target_id)
            .one(db)
            .await?
            .ok_or(ServerError::NotFound)?;
        return Box::pin(open_file(state, &target, range)).await;
    }

    let master_key = state.config.encryption.master_key()?;
    let file_key = unwrap_file_key(&master_key, &file.encryption_envelope)?;

    match file.storage_type {
        StorageType::Inline | StorageType::Single => {
            let plaintext = reconstruct_whole(state, file, &file_key).await?;
            let sliced = slice(plaintext, range);
            Ok(Reconstruction {
                stream: futures::stream::once(async move { Ok(Bytes::from(sliced)) }).boxed(),
                range,
            })
        }
        StorageType::Chunked | StorageType::ContentAddressed => {
            let storage = state.storage().await?.clone();
            let db = state.database().await?.clone();
            let manifest = file.chunk_manifest.0.clone();

            let stream = try_stream! {
                let mut emitted: u64 = 0;

                for entry in manifest {
                    let block_end = entry.offset + entry.size - 1;

                    if let Some(r) = range {
                        if block_end < r.start || entry.offset > r.end {
                            continue;
                        }
                    }

                    let content_hash = ContentHash::from_typed(&entry.hash)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                    let download = fetch_block(&storage, &db, &entry.hash, &content_hash)
                        .await
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    let crate::storage::Download::Stream(mut reader) = download;

                    let mut sealed = Vec::with_capacity(entry.size as usize + 28);
                    reader.read_to_end(&mut sealed).await?;

                    let block_key = FileKey::derive_convergent(content_hash.raw_bytes());
                    let plaintext = crypto::open_convergent_block(&block_key, &sealed, &content_hash.to_hex())
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                    let block_range = match range {
                        Some(r) => {
                            let lo = r.start.saturating_sub(entry.offset).max(0) as usize;
                            let hi = (r.end.min(block_end) - entry.offset) as usize;
                            &plaintext[lo..=hi]
                        }
                        None => &plaintext[..],
                    };

                    emitted += block_range.len() as u64;
                    yield Bytes::copy_from_slice(block_range);
                }

                let _ = emitted;
            };

            Ok(Reconstruction {
                stream: stream.boxed(),
                range,
            })
        }
    }
}

/// Fetches a block's ciphertext, trying its tracked tier first and falling
/// back to a Cache/Warm/Cold scan (the block row may be stale relative to an
/// in-flight migration).
async fn fetch_block(
    storage: &std::sync::Arc<Box<dyn crate::storage::StorageBackend>>,
    db: &sea_orm::DatabaseConnection,
    block_hash: &str,
    content_hash: &ContentHash,
) -> ServerResult<crate::storage::Download> {
    let tracked_tier = crate::database::entity::block::Entity::find_by_id(block_hash.to_owned())
        .one(db)
        .await?
        .map(|b| crate::storage::Tier::from(b.tier));

    let mut order = Vec::with_capacity(3);
    if let Some(t) = tracked_tier {
        order.push(t);
    }
    for t in [crate::storage::Tier::Cache, crate::storage::Tier::Warm, crate::storage::Tier::Cold] {
        if Some(t) != tracked_tier {
            order.push(t);
        }
    }

    for tier in order {
        if let Ok(d) = storage.get_block(tier, content_hash).await {
            return Ok(d);
        }
    }

    Err(ServerError::NotFound)
}

fn unwrap_file_key(master_key: &MasterKey, envelope_base64: &str) -> ServerResult<FileKey> {
    let wrapped = BASE64_STANDARD
        .decode(envelope_base64)
        .map_err(|e| ServerError::IntegrityFailure(e.to_string()))?;
    Ok(master_key.unwrap_key(&wrapped)?)
}

async fn reconstruct_whole(state: &State, file: &FileModel, file_key: &FileKey) -> ServerResult<Vec<u8>> {
    let sealed = match file.storage_type {
        StorageType::Inline => BASE64_STANDARD
            .decode(file.inline_payload.as_deref().unwrap_or_default())
            .map_err(|e| ServerError::IntegrityFailure(e.to_string()))?,
        StorageType::Single => {
            let storage = state.storage().await?;
            let storage_key = crate::storage::single_object_key(file.id);
            let tier = crate::storage::Tier::from(file.placement_tier);
            let crate::storage::Download::Stream(mut reader) = storage.get_block(tier, &storage_key).await?;
            let mut sealed = Vec::new();
            reader.read_to_end(&mut sealed).await.map_err(ServerError::storage_io)?;
            sealed
        }
        StorageType::DeduplicatedReference | StorageType::Chunked | StorageType::ContentAddressed => unreachable!(),
    };

    let plaintext =
        crypto::open_whole_file(file_key, &sealed).map_err(|e| ServerError::IntegrityFailure(e.to_string()))?;

    if file.dedup_info.0.compressed {
        let mut decoder = ZstdDecoder::new(BufReader::new(&plaintext[..]));
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.map_err(ServerError::storage_io)?;
        Ok(out)
    } else {
        Ok(plaintext)
    }
}

fn slice(data: Vec<u8>, range: Option<ByteRange>) -> Vec<u8> {
    match range {
        Some(r) => {
            let end = (r.end as usize + 1).min(data.len());
            let start = (r.start as usize).min(end);
            data[start..end].to_vec()
        }
        None => data,
    }
}

impl From<StorageTier> for crate::storage::Tier {
    fn from(tier: StorageTier) -> Self {
        match tier {
            StorageTier::Cache => Self::Cache,
            StorageTier::Warm => Self::Warm,
            StorageTier::Cold => Self::Cold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::entity::file::Entity as File;
    use crate::database::VaultDatabase;
    use uuid::Uuid;

    #[test]
    fn parse_range_parses_suffix_and_explicit_byte_ranges() {
        let total = 1000u64;

        let explicit = parse_range(Some("bytes=100-199"), total).unwrap().unwrap();
        assert_eq!((explicit.start, explicit.end), (100, 199));

        let open_ended = parse_range(Some("bytes=900-"), total).unwrap().unwrap();
        assert_eq!((open_ended.start, open_ended.end), (900, 999));

        let suffix = parse_range(Some("bytes=-50"), total).unwrap().unwrap();
        assert_eq!((suffix.start, suffix.end), (950, 999));

        assert!(parse_range(None, total).unwrap().is_none());
        assert!(parse_range(Some("not-a-range"), total).unwrap().is_none());

        assert!(matches!(
            parse_range(Some("bytes=2000-3000"), total),
            Err(ServerError::RangeUnsatisfiable { total_size }) if total_size == total
        ));
    }

    #[tokio::test]
    async fn range_request_on_single_object_returns_exact_slice() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        let plaintext = vault_core::testing::get_fake_data(4096);
        let file_key = FileKey::generate();
        let session = crate::testing::single_session(owner, "ranged.bin", &plaintext, &file_key, &master_key).await;
        let outcome = crate::ingest::complete_session(&state, &session).await.unwrap();

        let file = File::find_by_id(outcome.file_id).one(db).await.unwrap().unwrap();
        let range = parse_range(Some("bytes=100-299"), file.size as u64).unwrap();

        let reconstruction = open_file(&state, &file, range).await.unwrap();
        let bytes = crate::testing::collect_stream(reconstruction.stream).await;

        assert_eq!(bytes, plaintext[100..=299]);
        let r = reconstruction.range.unwrap();
        assert_eq!((r.start, r.end), (100, 299));
    }

    #[tokio::test]
    async fn range_request_on_chunked_file_slices_across_blocks() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        let plaintext = vault_core::testing::get_fake_data(20 * 1024);
        let file_key = FileKey::generate();
        let session = crate::testing::chunked_session_parts(
            owner,
            "chunked.bin",
            &[plaintext.as_slice()],
            &[0],
            &file_key,
            &master_key,
        )
        .await;
        let outcome = crate::ingest::complete_session(&state, &session).await.unwrap();

        let file = File::find_by_id(outcome.file_id).one(db).await.unwrap().unwrap();
        assert!(file.chunk_manifest.0.len() > 1, "20 KiB with a 4 KiB max block size should split");

        let range = parse_range(Some("bytes=500-8999"), file.size as u64).unwrap();
        let reconstruction = open_file(&state, &file, range).await.unwrap();
        let bytes = crate::testing::collect_stream(reconstruction.stream).await;

        assert_eq!(bytes, plaintext[500..=8999]);
    }

    #[tokio::test]
    async fn tampering_with_single_object_ciphertext_surfaces_integrity_failure() {
        let (state, storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        let plaintext = vec![5u8; 4096];
        let file_key = FileKey::generate();
        let session = crate::testing::single_session(owner, "tamper.bin", &plaintext, &file_key, &master_key).await;
        let outcome = crate::ingest::complete_session(&state, &session).await.unwrap();

        let file = File::find_by_id(outcome.file_id).one(db).await.unwrap().unwrap();

        let object_path = crate::testing::single_object_disk_path(&storage_dir, file.id);
        crate::testing::corrupt_last_byte(&object_path).await;

        let err = open_file(&state, &file, None).await.unwrap_err();
        assert!(matches!(err, ServerError::IntegrityFailure(_)));
    }
}
