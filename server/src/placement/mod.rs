//! Storage placement strategy selection and background tier migration.

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{LockBehavior, LockType};
use sea_orm::QuerySelect;
use tracing::instrument;

use crate::database::entity::file::{self, Entity as File, StorageTier};
use crate::error::ServerResult;
use crate::storage::Tier;
use crate::State;

/// Text-like extensions eligible for compression, when the payload is
/// large enough that compressing it is worth the CPU.
const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "txt", "log", "csv", "json", "xml", "sql", "html", "css", "js", "py", "java", "c", "cpp",
];

/// Below this size, compression overhead isn't worth paying.
const COMPRESSION_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Decides whether a file should be transparently compressed before
/// encryption, based on its name and declared size.
pub fn should_compress(file_name: &str, declared_size: u64) -> bool {
    if declared_size <= COMPRESSION_SIZE_THRESHOLD {
        return false;
    }

    file_name
        .rsplit_once('.')
        .map(|(_, ext)| COMPRESSIBLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn db_tier(tier: StorageTier) -> Tier {
    match tier {
        StorageTier::Cache => Tier::Cache,
        StorageTier::Warm => Tier::Warm,
        StorageTier::Cold => Tier::Cold,
    }
}

fn next_db_tier(tier: Tier) -> StorageTier {
    match tier {
        Tier::Cache => StorageTier::Cache,
        Tier::Warm => StorageTier::Warm,
        Tier::Cold => StorageTier::Cold,
    }
}

/// Walks single-object files and migrates their backing bytes to a colder
/// tier once they've gone unaccessed long enough. Chunked-file blocks are
/// shared resources and are migrated independently by the same sweep over
/// the `block` table, since a block's age is about its own last access,
/// not any one file's.
#[instrument(skip_all)]
pub async fn run_tier_migration(state: &State) -> ServerResult<()> {
    let db = state.database().await?;
    let storage = state.storage().await?;
    let now = Utc::now();

    let candidates = File::find()
        .filter(file::Column::StorageType.eq("single"))
        .filter(file::Column::PlacementTier.ne(StorageTier::Cold))
        .limit(500)
        .all(db)
        .await?;

    let mut migrated = 0u64;

    for f in candidates {
        let last_accessed = f.last_accessed.unwrap_or(f.created_at);
        let age_days = (now - last_accessed).num_days();
        let current = db_tier(f.placement_tier);

        let Some(next) = current.next(age_days) else {
            continue;
        };

        let Some(hash) = &f.content_hash else {
            continue;
        };
        let content_hash = vault_core::hash::ContentHash::from_typed(hash)?;

        storage.move_block(&content_hash, current, next).await?;

        let mut active: file::ActiveModel = f.into();
        active.placement_tier = sea_orm::ActiveValue::Set(next_db_tier(next));
        active.update(db).await?;

        migrated += 1;
    }

    tracing::info!("Migrated {} files to a colder tier", migrated);

    Ok(())
}

/// Migrates blocks (the chunked-strategy shared resource) based on their
/// own last-access time, independent of any particular owning file.
#[instrument(skip_all)]
pub async fn run_block_tier_migration(state: &State) -> ServerResult<()> {
    use crate::database::entity::block::{self, Entity as Block};

    let db = state.database().await?;
    let storage = state.storage().await?;
    let now = Utc::now();

    let candidates = Block::find()
        .filter(block::Column::Tier.ne(StorageTier::Cold))
        .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
        .limit(500)
        .all(db)
        .await?;

    let mut migrated = 0u64;

    for b in candidates {
        let age_days = (now - b.last_accessed.unwrap_or(b.created_at)).num_days();
        let current = db_tier(b.tier);

        let Some(next) = current.next(age_days) else {
            continue;
        };

        let content_hash = vault_core::hash::ContentHash::from_typed(&b.content_hash)?;
        storage.move_block(&content_hash, current, next).await?;

        let mut active: block::ActiveModel = b.into();
        active.tier = sea_orm::ActiveValue::Set(next_db_tier(next));
        active.update(db).await?;

        migrated += 1;
    }

    tracing::info!("Migrated {} blocks to a colder tier", migrated);

    Ok(())
}
