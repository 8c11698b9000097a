//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::cache_service::CacheError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    DatabaseError(sqlx::Error),
    StorageError(std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::StorageError(err) => {
                tracing::error!("Storage error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Database(err) => ApiError::DatabaseError(err),
            CacheError::Storage(err) => ApiError::StorageError(err),
            other @ (CacheError::NotReserved(_)
            | CacheError::AlreadyComplete { .. }
            | CacheError::Validation(_)
            | CacheError::InvalidRange(_)) => ApiError::BadRequest(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
