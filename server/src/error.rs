//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use vault_core::CoreError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error, mapped 1:1 to the taxonomy clients are expected to branch on.
#[derive(Debug, Display)]
pub enum ServerError {
    /// {0}
    Validation(String),

    /// Unauthorized.
    Auth,

    /// The requested resource does not exist.
    NotFound,

    /// {0}
    Conflict(String),

    /// Storage quota exceeded.
    QuotaExceeded,

    /// The requested range is not satisfiable (resource size is {total_size} bytes).
    RangeUnsatisfiable { total_size: u64 },

    /// Integrity check failed: {0}
    IntegrityFailure(String),

    /// Storage error: {0}
    StorageIO(AnyError),

    /// Temporarily unavailable: {0}
    Transient(AnyError),

    /// The server encountered an internal error or misconfiguration.
    Internal(AnyError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    message: String,
    status: u16,
}

impl ServerError {
    pub fn storage_io(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageIO(AnyError::new(error))
    }

    pub fn transient(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transient(AnyError::new(error))
    }

    pub fn internal(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Internal(AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation",
            Self::Auth => "Auth",
            Self::NotFound => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::RangeUnsatisfiable { .. } => "RangeUnsatisfiable",
            Self::IntegrityFailure(_) => "IntegrityFailure",
            Self::StorageIO(_) => "StorageIO",
            Self::Transient(_) => "Transient",
            Self::Internal(_) => "Internal",
        }
    }

    /// Strips internal detail from errors that shouldn't leak implementation
    /// details to clients.
    fn into_clients(self) -> Self {
        match self {
            Self::Internal(_) => Self::Internal(AnyError::msg("internal error")),
            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::QuotaExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RangeUnsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::IntegrityFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageIO(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<CoreError> for ServerError {
    fn from(error: CoreError) -> Self {
        Self::internal(error)
    }
}

impl From<sea_orm::DbErr> for ServerError {
    fn from(error: sea_orm::DbErr) -> Self {
        Self::transient(error)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(error: std::io::Error) -> Self {
        Self::storage_io(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::StorageIO(_) | Self::Transient(_) | Self::Internal(_) | Self::IntegrityFailure(_)
        ) {
            tracing::error!("{:?}", self);
        }

        let content_range = match &self {
            Self::RangeUnsatisfiable { total_size } => Some(format!("bytes */{total_size}")),
            _ => None,
        };

        let sanitized = self.into_clients();
        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            error: sanitized.name().to_string(),
            message: sanitized.to_string(),
            status: status_code.as_u16(),
        };

        let mut response = (status_code, Json(error_response)).into_response();
        if let Some(content_range) = content_range {
            if let Ok(value) = axum::http::HeaderValue::from_str(&content_range) {
                response.headers_mut().insert(axum::http::header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
