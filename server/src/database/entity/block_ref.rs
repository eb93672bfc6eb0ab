//! A reference binding a file to one of the blocks in its manifest.
//!
//! A block may become unavailable (disk corruption, a lost GC race) and be
//! removed from the database, in which case every file referencing it
//! through a `block_ref` row becomes unreconstructable until reuploaded.

use sea_orm::entity::prelude::*;

pub type BlockRefModel = Model;

/// A reference binding a file to a block, at a given manifest position.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "block_ref")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(indexed)]
    pub file_id: Uuid,

    /// Zero-indexed position in the file's manifest.
    pub seq: i32,

    /// Content hash of the referenced block. May point at a row that no
    /// longer exists if the block was lost; kept for repair tooling.
    #[sea_orm(indexed, column_type = "String(StringLen::N(75))")]
    pub block_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::file::Entity",
        from = "Column::FileId",
        to = "super::file::Column::Id"
    )]
    File,

    #[sea_orm(
        belongs_to = "super::block::Entity",
        from = "Column::BlockHash",
        to = "super::block::Column::ContentHash"
    )]
    Block,
}

impl Related<super::file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::File.def()
    }
}

impl Related<super::block::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Block.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
