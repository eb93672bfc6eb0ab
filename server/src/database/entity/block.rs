//! A content-addressed, refcounted block shared across files.

use sea_orm::entity::prelude::*;

use super::file::StorageTier;

pub type BlockModel = Model;

/// The state of a block.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(1))")]
pub enum BlockState {
    /// Write is in flight; not yet safe to reference from a completed file.
    #[sea_orm(string_value = "P")]
    PendingUpload,

    /// Bytes are on disk and this row may be referenced.
    #[sea_orm(string_value = "V")]
    Valid,

    /// `reference_count` reached zero and the collector has claimed it;
    /// this row is about to disappear.
    #[sea_orm(string_value = "D")]
    Deleted,
}

/// A content-addressed block.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "block")]
pub struct Model {
    /// Typed content hash (`sha256:<hex>`) of the plaintext block. Primary
    /// key: identity and addressing are the same thing for a CAS.
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(75))")]
    pub content_hash: String,

    pub size: i64,

    pub state: BlockState,

    pub tier: StorageTier,

    /// Owner of the first writer, used to scope convergent dedup lookups
    /// when cross-user deduplication is disabled.
    pub first_owner: Uuid,

    /// `reference_count >= 0`. A block's file on disk exists iff this is
    /// nonzero, modulo the brief window garbage collection re-verifies in.
    pub reference_count: i64,

    pub created_at: ChronoDateTimeUtc,

    pub last_accessed: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::block_ref::Entity")]
    BlockRef,
}

impl Related<super::block_ref::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BlockRef.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
