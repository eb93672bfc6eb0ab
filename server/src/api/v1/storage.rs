//! Per-user quota and storage distribution reporting.

use axum::extract::Extension;
use axum::Json;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{FromQueryResult, QuerySelect};
use serde::Serialize;

use crate::database::entity::file::{self, Entity as File};
use crate::database::VaultDatabase;
use crate::error::ServerResult;
use crate::{RequestState, State};

#[derive(Debug, FromQueryResult)]
struct GroupTotal {
    key: String,
    count: i64,
    bytes: i64,
}

#[derive(Serialize)]
pub(crate) struct StorageStats {
    quota_bytes: i64,
    used_bytes: i64,
    by_tier: Vec<DistributionEntry>,
    by_storage_type: Vec<DistributionEntry>,
}

#[derive(Serialize)]
pub(crate) struct DistributionEntry {
    key: String,
    file_count: i64,
    bytes: i64,
}

pub(crate) async fn stats(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
) -> ServerResult<Json<StorageStats>> {
    let owner = req_state.auth.require_owner()?;
    let db = state.database().await?;

    let user = db.get_or_create_user(owner).await?;

    let by_tier = group_totals(db, owner, file::Column::PlacementTier).await?;
    let by_storage_type = group_totals(db, owner, file::Column::StorageType).await?;

    Ok(Json(StorageStats {
        quota_bytes: user.quota,
        used_bytes: user.used,
        by_tier: by_tier.into_iter().map(DistributionEntry::from).collect(),
        by_storage_type: by_storage_type.into_iter().map(DistributionEntry::from).collect(),
    }))
}

async fn group_totals(
    db: &sea_orm::DatabaseConnection,
    owner: Uuid,
    column: file::Column,
) -> ServerResult<Vec<GroupTotal>> {
    let totals = File::find()
        .select_only()
        .column_as(column, "key")
        .column_as(Expr::col(file::Column::Id).count(), "count")
        .column_as(Expr::col(file::Column::Size).sum(), "bytes")
        .filter(file::Column::Owner.eq(owner))
        .group_by(column)
        .into_model::<GroupTotal>()
        .all(db)
        .await?;

    Ok(totals)
}

impl From<GroupTotal> for DistributionEntry {
    fn from(value: GroupTotal) -> Self {
        Self {
            key: value.key,
            file_count: value.count,
            bytes: value.bytes,
        }
    }
}
