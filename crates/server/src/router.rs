//! HTTP router construction.
//!
//! Assembles the job routes, CORS policy, and OpenAPI docs into a single
//! axum `Router`.

use std::sync::Arc;

use axum::http::header;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api;
use crate::state::AppState;

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_RANGE]);

    Router::new()
        .route("/", get(api::home))
        .route("/spec", get(api::spec))
        .route("/jobs", get(api::list_jobs).post(api::create_job))
        .route(
            "/jobs/{id}",
            get(api::get_job)
                .put(api::update_job)
                .delete(api::delete_job),
        )
        .layer(cors)
        .with_state(state)
        .merge(Scalar::with_url("/docs", api::doc::ApiDoc::openapi()))
}

// ── Tests ────────────────────────────────────────────────────────────
