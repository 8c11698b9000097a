//! API Module
//!
//! HTTP surface of the artifact cache, mounted under [`URL_BASE`].

pub mod cache;
pub mod error;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::cache_service::CacheService;

/// Path prefix every cache endpoint lives under
pub const URL_BASE: &str = "/_apis/artifactcache";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CacheService>,
    /// Externally reachable base URL, used to build archive locations
    pub external_url: String,
}

/// Create the cache router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/cache", get(cache::find))
        .route("/caches", post(cache::reserve))
        .route("/caches/{id}", post(cache::commit).patch(cache::upload))
        .route("/artifacts/{id}", get(cache::get_artifact))
        .route("/clean", post(cache::clean));

    Router::new()
        .nest(URL_BASE, api)
        .layer(middleware::from_fn_with_state(state.clone(), gc_after_request))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Kicks off a (coalesced) GC sweep once each request has been answered
async fn gc_after_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    state.service.spawn_gc();
    response
}
