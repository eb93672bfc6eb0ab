pub mod entity;
pub mod migration;

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, LockBehavior, LockType, Query};
use sea_orm::{ActiveValue::Set, ConnectionTrait, QuerySelect, TransactionTrait};
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use entity::block::{self, BlockModel, BlockState, Entity as Block};
use entity::file::{self, Entity as File, FileModel, StorageTier};
use entity::user::{self, Entity as User, UserModel};

/// Default per-user quota for accounts that don't exist yet.
///
/// User provisioning itself (registration) is out of scope; the first
/// request seen for a given owner lazily creates a row so quota
/// accounting has somewhere to live.
const DEFAULT_QUOTA_BYTES: i64 = 10 * 1024 * 1024 * 1024;

#[async_trait::async_trait]
pub trait VaultDatabase: Send + Sync {
    /// Returns the user row, creating it with the default quota if absent.
    async fn get_or_create_user(&self, id: Uuid) -> ServerResult<UserModel>;

    /// Atomically checks quota and reserves `declared_size` against it.
    /// Returns `QuotaExceeded` without modifying anything if it would
    /// overflow the user's quota.
    async fn reserve_quota(&self, owner: Uuid, declared_size: u64) -> ServerResult<()>;

    /// Releases a quota reservation that was never committed to a file
    /// (e.g. an upload session expired or was aborted).
    async fn release_quota(&self, owner: Uuid, amount: u64) -> ServerResult<()>;

    /// Looks up a File row matching a whole-file plaintext hash, scoped to
    /// `owner` unless cross-user dedup is enabled.
    async fn find_file_by_content_hash(
        &self,
        content_hash: &str,
        owner: Uuid,
        cross_user_dedup: bool,
    ) -> ServerResult<Option<FileModel>>;

    /// Finds or creates a Block row for `content_hash` within a single
    /// transaction, per the detect-then-increment protocol: the caller
    /// must hold the returned guard across the storage write so a
    /// concurrent duplicate can't be lost between the check and the
    /// refcount bump.
    async fn find_or_create_block(
        &self,
        content_hash: &str,
        size: u64,
        owner: Uuid,
        cross_user_dedup: bool,
    ) -> ServerResult<(BlockModel, bool)>;

    /// Marks a `PendingUpload` block `Valid` once its bytes have landed in
    /// storage.
    async fn mark_block_valid(&self, content_hash: &str) -> ServerResult<()>;

    /// Bumps a file's last-accessed timestamp.
    async fn bump_file_last_accessed(&self, file_id: Uuid) -> ServerResult<()>;

    /// Decrements the reference count of every block a file manifest
    /// referenced, as part of deleting the file.
    async fn release_file_blocks(&self, file_id: Uuid) -> ServerResult<()>;

    /// Deletes the `block_ref` rows belonging to a file. Must be called
    /// after `release_file_blocks` (which reads them to know what to
    /// decrement), as part of the same file-deletion sequence.
    async fn delete_block_refs(&self, file_id: Uuid) -> ServerResult<()>;

    /// Counts files pointing at `target_id` as their dedup target, used to
    /// pin a dedup target against deletion while references exist.
    async fn count_dedup_references(&self, target_id: Uuid) -> ServerResult<u64>;
}

#[async_trait::async_trait]
impl VaultDatabase for DatabaseConnection {
    async fn get_or_create_user(&self, id: Uuid) -> ServerResult<UserModel> {
        if let Some(user) = User::find_by_id(id).one(self).await? {
            return Ok(user);
        }

        let active = user::ActiveModel {
            id: Set(id),
            quota: Set(DEFAULT_QUOTA_BYTES),
            used: Set(0),
            created_at: Set(Utc::now()),
        };

        match active.insert(self).await {
            Ok(user) => Ok(user),
            // Lost the race to create the row; the winner's row is just as good.
            Err(_) => User::find_by_id(id)
                .one(self)
                .await?
                .ok_or_else(|| ServerError::internal(anyhow::anyhow!("user vanished after insert race"))),
        }
    }

    async fn reserve_quota(&self, owner: Uuid, declared_size: u64) -> ServerResult<()> {
        self.get_or_create_user(owner).await?;

        let txn = self.begin().await?;

        let user = User::find_by_id(owner)
            .lock_with_behavior(LockType::Update, LockBehavior::Nowait)
            .one(&txn)
            .await?
            .ok_or(ServerError::NotFound)?;

        let new_used = user.used + declared_size as i64;
        if new_used > user.quota {
            return Err(ServerError::QuotaExceeded);
        }

        let mut active: user::ActiveModel = user.into();
        active.used = Set(new_used);
        active.update(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    async fn release_quota(&self, owner: Uuid, amount: u64) -> ServerResult<()> {
        let txn = self.begin().await?;

        let user = User::find_by_id(owner)
            .lock_with_behavior(LockType::Update, LockBehavior::Nowait)
            .one(&txn)
            .await?
            .ok_or(ServerError::NotFound)?;

        let mut active: user::ActiveModel = user.clone().into();
        active.used = Set((user.used - amount as i64).max(0));
        active.update(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    async fn find_file_by_content_hash(
        &self,
        content_hash: &str,
        owner: Uuid,
        cross_user_dedup: bool,
    ) -> ServerResult<Option<FileModel>> {
        let mut query = File::find()
            .filter(file::Column::ContentHash.eq(content_hash))
            .order_by_asc(file::Column::CreatedAt);

        if !cross_user_dedup {
            query = query.filter(file::Column::Owner.eq(owner));
        }

        Ok(query.one(self).await?)
    }

    async fn find_or_create_block(
        &self,
        content_hash: &str,
        size: u64,
        owner: Uuid,
        cross_user_dedup: bool,
    ) -> ServerResult<(BlockModel, bool)> {
        let txn = self.begin().await?;

        let mut query = Block::find_by_id(content_hash.to_owned())
            .lock_with_behavior(LockType::Update, LockBehavior::Nowait)
            .filter(block::Column::State.eq(BlockState::Valid));

        if !cross_user_dedup {
            query = query.filter(block::Column::FirstOwner.eq(owner));
        }

        if let Some(existing) = query.one(&txn).await? {
            let mut active: block::ActiveModel = existing.clone().into();
            active.reference_count = Set(existing.reference_count + 1);
            active.last_accessed = Set(Some(Utc::now()));
            let updated = active.update(&txn).await?;
            txn.commit().await?;
            return Ok((updated, false));
        }

        let now = Utc::now();
        let active = block::ActiveModel {
            content_hash: Set(content_hash.to_owned()),
            size: Set(size as i64),
            state: Set(BlockState::PendingUpload),
            tier: Set(StorageTier::Cache),
            first_owner: Set(owner),
            reference_count: Set(1),
            created_at: Set(now),
            last_accessed: Set(Some(now)),
        };

        let created = match active.insert(&txn).await {
            Ok(model) => model,
            // Lost a race to create the same block; fall back to the
            // increment path against the winner's row.
            Err(_) => {
                txn.rollback().await?;
                return self
                    .find_or_create_block(content_hash, size, owner, cross_user_dedup)
                    .await;
            }
        };

        txn.commit().await?;
        Ok((created, true))
    }

    async fn mark_block_valid(&self, content_hash: &str) -> ServerResult<()> {
        Block::update(block::ActiveModel {
            content_hash: Set(content_hash.to_owned()),
            state: Set(BlockState::Valid),
            ..Default::default()
        })
        .exec(self)
        .await?;

        Ok(())
    }

    async fn bump_file_last_accessed(&self, file_id: Uuid) -> ServerResult<()> {
        let now = Utc::now();

        File::update(file::ActiveModel {
            id: Set(file_id),
            last_accessed: Set(Some(now)),
            ..Default::default()
        })
        .exec(self)
        .await?;

        Ok(())
    }

    async fn release_file_blocks(&self, file_id: Uuid) -> ServerResult<()> {
        use entity::block_ref::{self, Entity as BlockRef};

        let refs = BlockRef::find()
            .filter(block_ref::Column::FileId.eq(file_id))
            .all(self)
            .await?;

        for block_ref in refs {
            let decrement = Query::update()
                .table(Block)
                .value(
                    block::Column::ReferenceCount,
                    Expr::col(block::Column::ReferenceCount).sub(1),
                )
                .and_where(block::Column::ContentHash.eq(block_ref.block_hash.clone()))
                .to_owned();
            let stmt = self.get_database_backend().build(&decrement);
            self.execute(stmt).await?;
        }

        Ok(())
    }

    async fn delete_block_refs(&self, file_id: Uuid) -> ServerResult<()> {
        use entity::block_ref::{self, Entity as BlockRef};

        BlockRef::delete_many()
            .filter(block_ref::Column::FileId.eq(file_id))
            .exec(self)
            .await?;

        Ok(())
    }

    async fn count_dedup_references(&self, target_id: Uuid) -> ServerResult<u64> {
        Ok(File::find()
            .filter(file::Column::DedupTarget.eq(target_id))
            .count(self)
            .await?)
    }
}

/// Appends an append-only activity record. Best-effort from the caller's
/// point of view: a failure here is logged, never allowed to fail the
/// request it's describing.
pub async fn record_activity(
    db: &DatabaseConnection,
    user_id: Uuid,
    action: &str,
    object: &str,
    meta: serde_json::Value,
) {
    use entity::activity_record::ActiveModel;
    use entity::Json as JsonCol;

    let active = ActiveModel {
        user_id: Set(user_id),
        action: Set(action.to_owned()),
        object: Set(object.to_owned()),
        ip: Set(None),
        ua: Set(None),
        meta: Set(JsonCol(meta)),
        ts: Set(Utc::now()),
        ..Default::default()
    };

    if let Err(e) = active.insert(db).await {
        tracing::warn!("Failed to record activity ({action} on {object}): {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_or_create_block_ignores_non_valid_rows() {
        let (state, _storage_dir) = crate::testing::test_state().await;
        let db = state.database().await.unwrap();

        let owner = Uuid::new_v4();
        db.get_or_create_user(owner).await.unwrap();

        let hash = format!("sha256:{}", "ab".repeat(32));
        let now = Utc::now();

        let pending = block::ActiveModel {
            content_hash: Set(hash.clone()),
            size: Set(9),
            state: Set(BlockState::PendingUpload),
            tier: Set(StorageTier::Cache),
            first_owner: Set(owner),
            reference_count: Set(1),
            created_at: Set(now),
            last_accessed: Set(Some(now)),
        };
        pending.insert(db).await.unwrap();

        // A block still mid-flight must not be treated as an existing,
        // usable dedup hit: the caller would otherwise skip writing bytes
        // that never actually landed in storage.
        let still_pending = Block::find_by_id(hash.clone())
            .filter(block::Column::State.eq(BlockState::Valid))
            .one(db)
            .await
            .unwrap();
        assert!(still_pending.is_none());

        db.mark_block_valid(&hash).await.unwrap();

        let now_valid = Block::find_by_id(hash.clone())
            .filter(block::Column::State.eq(BlockState::Valid))
            .one(db)
            .await
            .unwrap();
        assert!(now_valid.is_some());

        let (found, created) = db.find_or_create_block(&hash, 9, owner, false).await.unwrap();
        assert!(!created, "a Valid block at this hash must be reused, not recreated");
        assert_eq!(found.reference_count, 2);
        assert_eq!(found.state, BlockState::Valid);
    }
}
