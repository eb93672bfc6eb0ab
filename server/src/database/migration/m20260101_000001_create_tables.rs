use sea_orm_migration::prelude::*;

use crate::database::entity::block::{self, Entity as Block};
use crate::database::entity::block_ref::{self, Entity as BlockRef};
use crate::database::entity::file::{self, Entity as File};
use crate::database::entity::user::{self, Entity as User};

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260101_000001_create_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(User)
                    .if_not_exists()
                    .col(ColumnDef::new(user::Column::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(user::Column::Quota).big_integer().not_null())
                    .col(ColumnDef::new(user::Column::Used).big_integer().not_null())
                    .col(
                        ColumnDef::new(user::Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(File)
                    .if_not_exists()
                    .col(ColumnDef::new(file::Column::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(file::Column::Owner).uuid().not_null())
                    .col(ColumnDef::new(file::Column::FolderId).uuid().null())
                    .col(ColumnDef::new(file::Column::Name).string().not_null())
                    .col(ColumnDef::new(file::Column::Size).big_integer().not_null())
                    .col(ColumnDef::new(file::Column::ContentHash).string().null())
                    .col(ColumnDef::new(file::Column::Mime).string().not_null())
                    .col(
                        ColumnDef::new(file::Column::StorageType)
                            .string_len(24)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(file::Column::PlacementTier)
                            .string_len(8)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(file::Column::EncryptionEnvelope)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(file::Column::InlinePayload).text().null())
                    .col(ColumnDef::new(file::Column::ChunkManifest).text().not_null())
                    .col(ColumnDef::new(file::Column::DedupInfo).text().not_null())
                    .col(ColumnDef::new(file::Column::DedupTarget).uuid().null())
                    .col(
                        ColumnDef::new(file::Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(file::Column::LastAccessed)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(File, file::Column::Owner)
                            .to(User, user::Column::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-file-owner")
                    .table(File)
                    .col(file::Column::Owner)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-file-content-hash")
                    .table(File)
                    .col(file::Column::ContentHash)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Block)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(block::Column::ContentHash)
                            .string_len(75)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(block::Column::Size).big_integer().not_null())
                    .col(ColumnDef::new(block::Column::State).string_len(1).not_null())
                    .col(ColumnDef::new(block::Column::Tier).string_len(8).not_null())
                    .col(ColumnDef::new(block::Column::FirstOwner).uuid().not_null())
                    .col(
                        ColumnDef::new(block::Column::ReferenceCount)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(block::Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(block::Column::LastAccessed)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-block-reference-count")
                    .table(Block)
                    .col(block::Column::ReferenceCount)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(BlockRef)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(block_ref::Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(block_ref::Column::FileId).uuid().not_null())
                    .col(ColumnDef::new(block_ref::Column::Seq).integer().not_null())
                    .col(
                        ColumnDef::new(block_ref::Column::BlockHash)
                            .string_len(75)
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(BlockRef, block_ref::Column::FileId)
                            .to(File, file::Column::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-block-ref-file")
                    .table(BlockRef)
                    .col(block_ref::Column::FileId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-block-ref-block-hash")
                    .table(BlockRef)
                    .col(block_ref::Column::BlockHash)
                    .to_owned(),
            )
            .await
    }
}
