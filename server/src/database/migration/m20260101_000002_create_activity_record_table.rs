use sea_orm_migration::prelude::*;

use crate::database::entity::activity_record::{self, Entity as ActivityRecord};

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20260101_000002_create_activity_record_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ActivityRecord)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(activity_record::Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(activity_record::Column::UserId).uuid().not_null())
                    .col(ColumnDef::new(activity_record::Column::Action).string().not_null())
                    .col(ColumnDef::new(activity_record::Column::Object).string().not_null())
                    .col(ColumnDef::new(activity_record::Column::Ip).string().null())
                    .col(ColumnDef::new(activity_record::Column::Ua).string().null())
                    .col(ColumnDef::new(activity_record::Column::Meta).text().not_null())
                    .col(
                        ColumnDef::new(activity_record::Column::Ts)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-activity-record-user")
                    .table(ActivityRecord)
                    .col(activity_record::Column::UserId)
                    .to_owned(),
            )
            .await
    }
}
