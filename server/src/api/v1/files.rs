//! File listing, download/preview, and deletion.

use axum::body::StreamBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use sea_orm::entity::prelude::*;
use sea_orm::QueryOrder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::entity::file::{self, Entity as File, FileModel};
use crate::database::{record_activity, VaultDatabase};
use crate::download;
use crate::error::{ServerError, ServerResult};
use crate::{RequestState, State};

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    folder_id: Option<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct FileSummary {
    id: Uuid,
    name: String,
    size: i64,
    mime: String,
    folder_id: Option<Uuid>,
    created_at: String,
}

impl From<FileModel> for FileSummary {
    fn from(model: FileModel) -> Self {
        Self {
            id: model.id,
            name: model.name,
            size: model.size,
            mime: model.mime,
            folder_id: model.folder_id,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

pub(crate) async fn list(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Query(query): Query<ListQuery>,
) -> ServerResult<Json<Vec<FileSummary>>> {
    let owner = req_state.auth.require_owner()?;
    let db = state.database().await?;

    let mut q = File::find()
        .filter(file::Column::Owner.eq(owner))
        .order_by_desc(file::Column::CreatedAt);

    if let Some(folder_id) = query.folder_id {
        q = q.filter(file::Column::FolderId.eq(folder_id));
    }

    let files = q.all(db).await?;
    Ok(Json(files.into_iter().map(FileSummary::from).collect()))
}

async fn find_owned(state: &State, owner: Uuid, file_id: Uuid) -> ServerResult<FileModel> {
    let db = state.database().await?;
    let file = File::find_by_id(file_id).one(db).await?.ok_or(ServerError::NotFound)?;
    if file.owner != owner {
        return Err(ServerError::NotFound);
    }
    Ok(file)
}

pub(crate) async fn download(
    method: Method,
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> ServerResult<Response> {
    let owner = req_state.auth.require_owner()?;
    let file = find_owned(&state, owner, file_id).await?;

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let range = download::parse_range(range_header, file.size as u64)?;

    let reconstruction = download::open_file(&state, &file, range).await?;

    if method == Method::GET {
        let db = state.database().await?;
        db.bump_file_last_accessed(file.id).await?;
        record_activity(
            db,
            owner,
            "file.download",
            &file.id.to_string(),
            serde_json::json!({ "name": file.name }),
        )
        .await;
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.mime).unwrap_or_else(|_| HeaderValue::from_static(vault_core::mime::OCTET_STREAM)),
    );
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&format!("\"{}\"", file.content_hash.as_deref().unwrap_or(&file.id.to_string())))
            .unwrap_or_else(|_| HeaderValue::from_static("\"unknown\"")),
    );

    let status = if let Some(r) = reconstruction.range {
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", r.start, r.end, file.size))
                .map_err(|e| ServerError::internal(anyhow::anyhow!(e)))?,
        );
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&r.len().to_string()).map_err(|e| ServerError::internal(anyhow::anyhow!(e)))?,
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&file.size.to_string()).map_err(|e| ServerError::internal(anyhow::anyhow!(e)))?,
        );
        StatusCode::OK
    };

    if method == Method::HEAD {
        return Ok((status, response_headers).into_response());
    }

    let body = StreamBody::new(reconstruction.stream);
    Ok((status, response_headers, body).into_response())
}

pub(crate) async fn preview(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(file_id): Path<Uuid>,
) -> ServerResult<Response> {
    let owner = req_state.auth.require_owner()?;
    let file = find_owned(&state, owner, file_id).await?;

    if !file.mime.starts_with("image/") {
        return Err(ServerError::Validation("preview is only available for image files".into()));
    }

    let reconstruction = download::open_file(&state, &file, None).await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.mime).unwrap_or_else(|_| HeaderValue::from_static(vault_core::mime::OCTET_STREAM)),
    );

    let body = StreamBody::new(reconstruction.stream);
    Ok((StatusCode::OK, response_headers, body).into_response())
}

pub(crate) async fn delete(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(file_id): Path<Uuid>,
) -> ServerResult<StatusCode> {
    let owner = req_state.auth.require_owner()?;
    delete_one(&state, owner, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(crate) struct BulkDeleteRequest {
    file_ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct BulkDeleteResponse {
    deleted: Vec<Uuid>,
    failed: Vec<BulkDeleteFailure>,
}

#[derive(Serialize)]
pub(crate) struct BulkDeleteFailure {
    file_id: Uuid,
    error: String,
}

pub(crate) async fn bulk_delete(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Json(body): Json<BulkDeleteRequest>,
) -> ServerResult<Json<BulkDeleteResponse>> {
    let owner = req_state.auth.require_owner()?;

    let mut deleted = Vec::new();
    let mut failed = Vec::new();

    for file_id in body.file_ids {
        match delete_one(&state, owner, file_id).await {
            Ok(()) => deleted.push(file_id),
            Err(e) => failed.push(BulkDeleteFailure { file_id, error: e.to_string() }),
        }
    }

    Ok(Json(BulkDeleteResponse { deleted, failed }))
}

/// Deletes a file the caller owns, pinning `deduplicated_reference` targets
/// against removal while other files still point at them.
async fn delete_one(state: &State, owner: Uuid, file_id: Uuid) -> ServerResult<()> {
    let file = find_owned(state, owner, file_id).await?;
    let db = state.database().await?;

    if file.storage_type != crate::database::entity::file::StorageType::DeduplicatedReference {
        let references = db.count_dedup_references(file.id).await?;
        if references > 0 {
            return Err(ServerError::Conflict(format!(
                "file is a dedup target for {references} other file(s)"
            )));
        }
    }

    match file.storage_type {
        crate::database::entity::file::StorageType::Chunked
        | crate::database::entity::file::StorageType::ContentAddressed => {
            db.release_file_blocks(file.id).await?;
            db.delete_block_refs(file.id).await?;
        }
        crate::database::entity::file::StorageType::Single => {
            // Single-object bytes aren't refcounted like blocks; a content
            // hash match against an existing file produces a
            // `deduplicated_reference` rather than a second physical copy,
            // so once references are clear this file is the sole owner of
            // its storage slot (keyed by file id, see `storage::single_object_key`).
            let storage = state.storage().await?;
            let storage_key = crate::storage::single_object_key(file.id);
            let tier = crate::storage::Tier::from(file.placement_tier);
            let _ = storage.delete_block(tier, &storage_key).await;
        }
        crate::database::entity::file::StorageType::Inline
        | crate::database::entity::file::StorageType::DeduplicatedReference => {}
    }

    File::delete_by_id(file.id).exec(db).await?;
    db.release_quota(owner, file.size as u64).await?;

    record_activity(
        db,
        owner,
        "file.delete",
        &file.id.to_string(),
        serde_json::json!({ "name": file.name }),
    )
    .await;

    Ok(())
}
