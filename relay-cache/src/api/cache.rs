//! Cache API Handlers
//!
//! Endpoints of the artifact cache protocol spoken by workflow cache steps.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use relay_core::dto::cache::{CacheHit, LookupQuery, ReserveCacheRequest, ReserveCacheResponse};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::api::error::{ApiError, ApiResult};
use crate::api::{AppState, URL_BASE};
use crate::service::cache_service::{ContentRange, Reservation};

/// GET /cache?keys=<csv>&version=<v>
/// Look up a complete entry; 204 on miss
pub async fn find(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> ApiResult<Response> {
    let keys = query.key_list();
    tracing::debug!("Looking up cache {:?} version {}", keys, query.version);

    let Some(record) = state.service.lookup(&keys, &query.version).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let hit = CacheHit {
        result: "hit".to_string(),
        archive_location: format!("{}{}/artifacts/{}", state.external_url, URL_BASE, record.id),
        cache_key: record.key,
    };
    Ok(Json(hit).into_response())
}

/// POST /caches
/// Reserve a key/version for upload
///
/// Answers 200 with an empty body while another writer holds the reservation.
pub async fn reserve(
    State(state): State<AppState>,
    Json(req): Json<ReserveCacheRequest>,
) -> ApiResult<Response> {
    match state.service.reserve(&req.key, &req.version).await? {
        Reservation::Reserved(cache_id) => Ok(Json(ReserveCacheResponse { cache_id }).into_response()),
        Reservation::InProgress => {
            tracing::debug!("Cache {:?} is already being uploaded", req.key);
            Ok(StatusCode::OK.into_response())
        }
    }
}

/// PATCH /caches/{id}
/// Write one `Content-Range` chunk of a reserved entry
pub async fn upload(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let value = headers
        .get(header::CONTENT_RANGE)
        .ok_or_else(|| ApiError::BadRequest("missing Content-Range header".to_string()))?
        .to_str()
        .map_err(|e| ApiError::BadRequest(format!("invalid Content-Range header: {}", e)))?;
    let range = ContentRange::parse(value)?;

    state.service.upload(id, range, &body).await?;
    Ok(StatusCode::OK)
}

/// POST /caches/{id}
/// Commit an uploaded entry
pub async fn commit(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.service.commit(id).await?;
    Ok(StatusCode::OK)
}

/// GET /artifacts/{id}
/// Stream a committed blob, honoring `Range` requests
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    request: Request,
) -> Response {
    state.service.touch(id).await;

    let path = state.service.storage().path(id);
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// POST /clean
/// Force deletion is not supported; always succeeds
pub async fn clean() -> StatusCode {
    StatusCode::OK
}
