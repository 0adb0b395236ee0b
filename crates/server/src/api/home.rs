//! Root and spec endpoints.

use axum::Json;
use serde_json::{json, Value};
use utoipa::OpenApi;

use super::doc::ApiDoc;

/// Available endpoints for the web api.
#[utoipa::path(
    get,
    path = "/",
    tag = "docs",
    responses((status = 200, description = "List of available endpoints")),
)]
pub async fn home() -> Json<Value> {
    Json(json!({
        "resources": [
            {
                "link": { "rel": "jobs", "title": "Jobs", "href": "/jobs" },
            },
            {
                "link": { "rel": "spec", "title": "Spec", "href": "/spec" },
            },
        ],
    }))
}

/// The OpenAPI document for this service.
#[utoipa::path(
    get,
    path = "/spec",
    tag = "docs",
    responses((status = 200, description = "OpenAPI document")),
)]
pub async fn spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_home_lists_jobs_and_spec() {
        let Json(body) = home().await;
        let resources = body["resources"].as_array().unwrap();
        let hrefs: Vec<&str> = resources
            .iter()
            .map(|r| r["link"]["href"].as_str().unwrap())
            .collect();
        assert_eq!(hrefs, vec!["/jobs", "/spec"]);
    }

    #[tokio::test]
    async fn test_spec_document_has_job_paths() {
        let Json(doc) = spec().await;
        let value = serde_json::to_value(&doc).unwrap();
        assert!(value["paths"]["/jobs"].is_object());
        assert!(value["paths"]["/jobs/{id}"].is_object());
    }
}
