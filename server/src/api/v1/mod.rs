mod files;
mod storage;
mod upload;

use axum::{
    routing::{delete, get, post},
    Router,
};

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/api/v1/upload/init", post(upload::init))
        .route("/api/v1/upload/chunk/:sid", post(upload::accept_chunk))
        .route("/api/v1/upload/direct/:sid", post(upload::accept_direct))
        .route("/api/v1/upload/complete/:sid", post(upload::complete))
        .route("/api/v1/upload/resume/:sid", get(upload::resume))
        .route("/api/v1/files", get(files::list))
        .route(
            "/api/v1/files/:id/download",
            get(files::download).head(files::download),
        )
        .route("/api/v1/files/:id/preview", get(files::preview))
        .route("/api/v1/files/:id", delete(files::delete))
        .route("/api/v1/files/bulk-delete", post(files::bulk_delete))
        .route("/api/v1/storage/stats", get(storage::stats))
}
