//! Upload session lifecycle: init, chunk/direct accept, completion, resume.

use axum::extract::{BodyStream, Extension, Path, Query};
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::database::{record_activity, VaultDatabase};
use crate::error::{ServerError, ServerResult};
use crate::ingest::{self, chunk_frame_path, single_frame_path};
use crate::placement;
use crate::session::{AcceptedChunk, Strategy, UploadSession};
use crate::{RequestState, State};
use vault_core::crypto::FileKey;

#[derive(Deserialize)]
pub(crate) struct InitRequest {
    file_name: String,
    file_size: u64,
    folder_id: Option<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct InitResponse {
    session_id: Uuid,
    strategy: &'static str,
    chunk_size: u64,
    chunk_count: u32,
    direct_upload: bool,
}

pub(crate) async fn init(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Json(body): Json<InitRequest>,
) -> ServerResult<Json<InitResponse>> {
    let owner = req_state.auth.require_owner()?;
    let db = state.database().await?;

    db.reserve_quota(owner, body.file_size).await?;

    let chunking = &state.config.chunking;
    let strategy = Strategy::for_size(body.file_size, chunking.inline_threshold, chunking.single_object_threshold);
    let chunk_size = chunking.chunk_size;
    let chunk_count = match strategy {
        Strategy::Chunked => (body.file_size.div_ceil(chunk_size)) as u32,
        _ => 1,
    };
    let compress = placement::should_compress(&body.file_name, body.file_size);

    let master_key = state.config.encryption.master_key()?;
    let file_key = FileKey::generate();
    let wrapped_file_key = master_key.wrap(&file_key);

    let session_id = Uuid::new_v4();
    let session = UploadSession {
        id: session_id,
        owner,
        file_name: body.file_name,
        folder_id: body.folder_id,
        declared_size: body.file_size,
        strategy,
        chunk_size,
        expected_chunk_count: chunk_count,
        received_indices: Default::default(),
        chunk_block_hashes: vec![None; chunk_count as usize],
        wrapped_file_key,
        compress,
        inline_payload: None,
        single_object_path: None,
        whole_file_payload_hash: None,
        start_time: Utc::now(),
    };

    state.session_cache().await?.put(&session).await?;

    Ok(Json(InitResponse {
        session_id,
        strategy: strategy_name(strategy),
        chunk_size,
        chunk_count,
        direct_upload: matches!(strategy, Strategy::Inline | Strategy::Single),
    }))
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Inline => "inline",
        Strategy::Single => "single",
        Strategy::Chunked => "chunked",
    }
}

#[derive(Deserialize)]
pub(crate) struct ChunkQuery {
    chunk_index: u32,
}

#[derive(Serialize)]
pub(crate) struct ChunkResponse {
    status: &'static str,
    progress: f64,
}

pub(crate) async fn accept_chunk(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(sid): Path<Uuid>,
    Query(query): Query<ChunkQuery>,
    mut stream: BodyStream,
) -> ServerResult<Json<ChunkResponse>> {
    let owner = req_state.auth.require_owner()?;
    let cache = state.session_cache().await?;

    let mut session = load_owned_session(cache, sid, owner).await?;

    if !matches!(session.strategy, Strategy::Chunked) {
        return Err(ServerError::Validation("session is not a chunked upload".into()));
    }
    if query.chunk_index >= session.expected_chunk_count {
        return Err(ServerError::Validation(format!("chunk index {} out of range", query.chunk_index)));
    }

    if session.received_indices.contains(&query.chunk_index) {
        return Ok(Json(ChunkResponse {
            status: "already_uploaded",
            progress: progress(&session),
        }));
    }

    let mut original = Vec::new();
    while let Some(bytes) = stream.next().await {
        let bytes = bytes.map_err(ServerError::storage_io)?;
        original.extend_from_slice(&bytes);
    }

    let mut hasher = Sha256::new();
    hasher.update(&original);
    let content_hash = hex::encode(hasher.finalize());

    let payload = if session.compress {
        compress_zstd(&original).await?
    } else {
        original.clone()
    };

    let master_key = state.config.encryption.master_key()?;
    let file_key = session.file_key(&master_key)?;
    let sealed = vault_core::crypto::seal_chunk(&file_key, &payload, query.chunk_index as u64);

    let frame_path = chunk_frame_path(sid, query.chunk_index);
    ingest::ensure_frame_dir(sid).await.map_err(ServerError::storage_io)?;
    let mut frame = tokio::fs::File::create(&frame_path).await.map_err(ServerError::storage_io)?;
    frame.write_all(&sealed).await.map_err(ServerError::storage_io)?;

    session.received_indices.insert(query.chunk_index);
    session.chunk_block_hashes[query.chunk_index as usize] = Some(AcceptedChunk {
        content_hash,
        size: original.len() as u64,
        frame_path: frame_path.to_string_lossy().into_owned(),
    });

    cache.put(&session).await?;

    Ok(Json(ChunkResponse {
        status: "accepted",
        progress: progress(&session),
    }))
}

pub(crate) async fn accept_direct(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(sid): Path<Uuid>,
    mut stream: BodyStream,
) -> ServerResult<Json<serde_json::Value>> {
    let owner = req_state.auth.require_owner()?;
    let cache = state.session_cache().await?;

    let mut session = load_owned_session(cache, sid, owner).await?;

    if matches!(session.strategy, Strategy::Chunked) {
        return Err(ServerError::Validation("direct upload is only for inline/single sessions".into()));
    }

    let mut original = Vec::new();
    while let Some(bytes) = stream.next().await {
        let bytes = bytes.map_err(ServerError::storage_io)?;
        original.extend_from_slice(&bytes);
    }

    let mut hasher = Sha256::new();
    hasher.update(&original);
    let whole_hash = vault_core::hash::ContentHash::Sha256(hasher.finalize().into());
    let typed_hash = whole_hash.to_typed_hex();

    let payload = if session.compress {
        compress_zstd(&original).await?
    } else {
        original
    };

    let master_key = state.config.encryption.master_key()?;
    let file_key = session.file_key(&master_key)?;
    let sealed = vault_core::crypto::seal_whole_file(&file_key, &payload);

    match session.strategy {
        Strategy::Inline => {
            session.inline_payload = Some(BASE64_STANDARD.encode(&sealed));
        }
        Strategy::Single => {
            let path = single_frame_path(sid);
            ingest::ensure_frame_dir(sid).await.map_err(ServerError::storage_io)?;
            let mut frame = tokio::fs::File::create(&path).await.map_err(ServerError::storage_io)?;
            frame.write_all(&sealed).await.map_err(ServerError::storage_io)?;
            session.single_object_path = Some(path.to_string_lossy().into_owned());
        }
        Strategy::Chunked => unreachable!("checked above"),
    }

    session.whole_file_payload_hash = Some(typed_hash);
    cache.put(&session).await?;

    Ok(Json(serde_json::json!({ "ready_for_completion": true })))
}

#[derive(Serialize)]
pub(crate) struct CompleteResponse {
    file_id: Uuid,
    status: &'static str,
    dedup_ratio: f64,
    logical_size: u64,
    saved_size: u64,
    throughput_bytes_per_sec: f64,
}

pub(crate) async fn complete(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(sid): Path<Uuid>,
) -> ServerResult<Json<CompleteResponse>> {
    let owner = req_state.auth.require_owner()?;
    let cache = state.session_cache().await?;

    let session = load_owned_session(cache, sid, owner).await?;

    let outcome = ingest::complete_session(&state, &session).await?;
    let db = state.database().await?;

    record_activity(
        db,
        owner,
        "upload.complete",
        &outcome.file_id.to_string(),
        serde_json::json!({ "status": outcome.status, "size": outcome.logical_size }),
    )
    .await;

    cache.delete(sid).await?;

    let elapsed = (Utc::now() - session.start_time).num_milliseconds().max(1) as f64 / 1000.0;
    let throughput = session.declared_size as f64 / elapsed;

    Ok(Json(CompleteResponse {
        file_id: outcome.file_id,
        status: outcome.status,
        dedup_ratio: outcome.dedup_ratio(),
        logical_size: outcome.logical_size,
        saved_size: outcome.saved_size,
        throughput_bytes_per_sec: throughput,
    }))
}

#[derive(Serialize)]
pub(crate) struct ResumeResponse {
    uploaded_indices: Vec<u32>,
    missing_indices: Vec<u32>,
    progress: f64,
}

pub(crate) async fn resume(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(sid): Path<Uuid>,
) -> ServerResult<Json<ResumeResponse>> {
    let owner = req_state.auth.require_owner()?;
    let cache = state.session_cache().await?;

    let session = load_owned_session(cache, sid, owner).await?;

    Ok(Json(ResumeResponse {
        uploaded_indices: session.received_indices.iter().copied().collect(),
        missing_indices: session.missing_indices(),
        progress: progress(&session),
    }))
}

async fn load_owned_session(
    cache: &std::sync::Arc<dyn crate::session::SessionCache>,
    sid: Uuid,
    owner: Uuid,
) -> ServerResult<UploadSession> {
    let session = cache.get(sid).await?.ok_or(ServerError::NotFound)?;
    if session.owner != owner {
        return Err(ServerError::NotFound);
    }
    Ok(session)
}

fn progress(session: &UploadSession) -> f64 {
    if session.expected_chunk_count == 0 {
        100.0
    } else {
        (session.received_indices.len() as f64 / session.expected_chunk_count as f64) * 100.0
    }
}

async fn compress_zstd(data: &[u8]) -> ServerResult<Vec<u8>> {
    use async_compression::tokio::write::ZstdEncoder;

    let mut encoder = ZstdEncoder::new(Vec::new());
    encoder.write_all(data).await.map_err(ServerError::storage_io)?;
    encoder.shutdown().await.map_err(ServerError::storage_io)?;
    Ok(encoder.into_inner())
}
