//! Garbage collection.
//!
//! Reaps blocks whose reference count has reached zero and expires file
//! versions past their retention window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{LockBehavior, LockType, Query};
use sea_orm::{ActiveValue::Set, ConnectionTrait, QuerySelect};
use tokio::sync::Semaphore;
use tokio::time;
use tracing::instrument;

use super::{State, StateInner};
use crate::config::Config;
use crate::database::entity::block::{self, BlockState, Entity as Block};
use crate::database::entity::block_ref::{self, Entity as BlockRef};
use crate::database::entity::file::{self, Entity as File};
use crate::placement;

/// Summary of a single garbage collection pass.
#[derive(Debug, Default, serde::Serialize)]
pub struct GcSummary {
    pub deleted: u64,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

/// Runs garbage collection periodically.
pub async fn run_garbage_collection(config: Config) {
    let interval = config.garbage_collection.interval;

    if interval == Duration::ZERO {
        return;
    }

    loop {
        if let Err(e) = run_garbage_collection_once(config.clone()).await {
            tracing::warn!("Garbage collection failed: {}", e);
        }

        time::sleep(interval).await;
    }
}

/// Runs garbage collection once.
#[instrument(skip_all)]
pub async fn run_garbage_collection_once(config: Config) -> Result<()> {
    tracing::info!("Running garbage collection...");

    let state = StateInner::new(config).await;

    run_expire_old_versions(&state).await?;
    let summary = run_reap_orphan_blocks(&state).await?;
    placement::run_tier_migration(&state).await?;
    placement::run_block_tier_migration(&state).await?;

    tracing::info!(
        "Garbage collection complete: deleted {}, freed {} bytes, {} errors",
        summary.deleted,
        summary.freed_bytes,
        summary.errors.len()
    );

    Ok(())
}

/// Expires file versions past `version_retention_days`.
///
/// Versioning itself lives above this crate's boundary as a thin wrapper
/// over file rows sharing a logical identity; this pass only needs to
/// know how to delete a file and release its blocks, which is exactly
/// what normal file deletion does.
#[instrument(skip_all)]
async fn run_expire_old_versions(state: &State) -> Result<()> {
    let db = state.database().await?;
    let retention_days = state.config.garbage_collection.version_retention_days;

    if retention_days == 0 {
        return Ok(());
    }

    let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);

    let expired = File::find()
        .filter(file::Column::CreatedAt.lt(cutoff))
        .filter(
            file::Column::LastAccessed
                .is_null()
                .or(file::Column::LastAccessed.lt(cutoff)),
        )
        .all(db)
        .await?;

    tracing::info!("Found {} file versions past retention", expired.len());

    for f in expired {
        crate::database::VaultDatabase::release_file_blocks(db, f.id).await?;
        File::delete_by_id(f.id).exec(db).await?;
    }

    Ok(())
}

/// Reaps blocks whose reference count has dropped to zero.
///
/// Two-phase, mirroring the protocol the refcounting scheme requires: lock
/// the candidate row (`SKIP LOCKED` so concurrent collectors or writers
/// don't block on each other), re-verify no `block_ref` row resurrected it
/// since the query ran, then unlink and delete. The unlink is
/// remove-if-present, and a writer that finds a block's file missing but
/// its row still present must re-materialize it — the inverse race is
/// handled by `find_or_create_block` re-querying under lock.
#[instrument(skip_all)]
async fn run_reap_orphan_blocks(state: &State) -> Result<GcSummary> {
    let db = state.database().await?;
    let storage = state.storage().await?;

    let candidate_ids = Query::select()
        .from(Block)
        .expr(block::Column::ContentHash.into_expr())
        .and_where(block::Column::ReferenceCount.lte(0))
        .and_where(block::Column::State.eq(BlockState::Valid))
        .lock_with_tables_behavior(LockType::Update, [Block], LockBehavior::SkipLocked)
        .to_owned();

    let candidates: Vec<block::Model> = Block::find()
        .filter(block::Column::ContentHash.in_subquery(candidate_ids))
        .limit(1000)
        .all(db)
        .await?;

    let mut summary = GcSummary::default();

    if candidates.is_empty() {
        return Ok(summary);
    }

    let mut reapable = Vec::new();

    for candidate in candidates {
        let live_refs = BlockRef::find()
            .filter(block_ref::Column::BlockHash.eq(candidate.content_hash.clone()))
            .count(db)
            .await?;

        if live_refs > 0 {
            // A concurrent completion raced us; repair the counter instead
            // of deleting a block that's actually referenced.
            let mut active: block::ActiveModel = candidate.clone().into();
            active.reference_count = Set(live_refs as i64);
            active.update(db).await?;
            continue;
        }

        let mut active: block::ActiveModel = candidate.clone().into();
        active.state = Set(BlockState::Deleted);
        active.update(db).await?;
        reapable.push(candidate);
    }

    if reapable.is_empty() {
        return Ok(summary);
    }

    let delete_limit = Arc::new(Semaphore::new(20));
    let futures: Vec<_> = reapable
        .into_iter()
        .map(|block| {
            let delete_limit = delete_limit.clone();
            let storage = storage.clone();
            async move {
                let permit = delete_limit.acquire().await?;
                let content_hash = vault_core::hash::ContentHash::from_typed(&block.content_hash)?;
                let tier = match block.tier {
                    file::StorageTier::Cache => crate::storage::Tier::Cache,
                    file::StorageTier::Warm => crate::storage::Tier::Warm,
                    file::StorageTier::Cold => crate::storage::Tier::Cold,
                };
                storage.delete_block(tier, &content_hash).await?;
                drop(permit);
                Result::<_, anyhow::Error>::Ok((block.content_hash, block.size as u64))
            }
        })
        .collect();

    let results = join_all(futures).await;

    let mut deleted_hashes = Vec::new();
    for result in results {
        match result {
            Ok((hash, size)) => {
                summary.deleted += 1;
                summary.freed_bytes += size;
                deleted_hashes.push(hash);
            }
            Err(e) => {
                tracing::warn!("Block deletion failed: {}", e);
                summary.errors.push(e.to_string());
            }
        }
    }

    if !deleted_hashes.is_empty() {
        Block::delete_many()
            .filter(block::Column::ContentHash.is_in(deleted_hashes))
            .exec(db)
            .await?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_core::crypto::FileKey;

    #[tokio::test]
    async fn deleting_a_chunked_file_and_running_gc_reaps_its_blocks() {
        let (state, storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();
        let master_key = state.config.encryption.master_key().unwrap();
        let owner = Uuid::new_v4();
        crate::database::VaultDatabase::get_or_create_user(db, owner).await.unwrap();

        let plaintext = vault_core::testing::get_fake_data(20 * 1024);
        let file_key = FileKey::generate();
        let session = crate::testing::chunked_session_parts(
            owner,
            "gc.bin",
            &[plaintext.as_slice()],
            &[0],
            &file_key,
            &master_key,
        )
        .await;
        let outcome = crate::ingest::complete_session(&state, &session).await.unwrap();

        let file = File::find_by_id(outcome.file_id).one(db).await.unwrap().unwrap();
        let block_hashes: Vec<String> = file.chunk_manifest.0.iter().map(|e| e.hash.clone()).collect();
        assert!(!block_hashes.is_empty());

        let disk_paths: Vec<_> = block_hashes
            .iter()
            .map(|h| {
                let hash = vault_core::hash::ContentHash::from_typed(h).unwrap();
                storage_dir.join("cache").join(hash.shard_prefix(2)).join(hash.to_hex())
            })
            .collect();
        for path in &disk_paths {
            assert!(path.exists(), "block bytes should be on disk right after upload");
        }

        // Mirrors the deletion sequence a `chunked` file goes through: release
        // each block's refcount, drop the file's block_ref rows, then the
        // file row itself. Refcounts now at zero, a GC pass should reap them.
        crate::database::VaultDatabase::release_file_blocks(db, file.id).await.unwrap();
        crate::database::VaultDatabase::delete_block_refs(db, file.id).await.unwrap();
        File::delete_by_id(file.id).exec(db).await.unwrap();

        run_garbage_collection_once(state.config.clone()).await.unwrap();

        for hash in &block_hashes {
            let remaining = Block::find_by_id(hash.clone()).one(db).await.unwrap();
            assert!(remaining.is_none(), "GC should have deleted the orphaned block row");
        }
        for path in &disk_paths {
            assert!(!path.exists(), "GC should have deleted the block's on-disk bytes");
        }
    }
}
