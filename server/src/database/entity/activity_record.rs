//! Append-only activity log.

use sea_orm::entity::prelude::*;

use super::Json;

pub type ActivityRecordModel = Model;

#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "activity_record")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(indexed)]
    pub user_id: Uuid,

    /// Short verb, e.g. `upload`, `download`, `delete`.
    pub action: String,

    /// The object acted on, e.g. a file id.
    pub object: String,

    pub ip: Option<String>,

    pub ua: Option<String>,

    pub meta: Json<serde_json::Value>,

    pub ts: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
