//! OpenAPI documentation aggregator.
//!
//! Collects the `#[utoipa::path]`-annotated handlers into a single spec,
//! served as JSON at `/spec` and via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ECS Scheduler API",
        version = "0.1.0",
        description = "Cron-style scheduling of ephemeral ECS tasks with queue-depth triggers.",
    ),
    tags(
        (name = "jobs", description = "Scheduled job CRUD"),
        (name = "docs", description = "Service discovery and API documentation"),
    ),
    paths(
        crate::api::home::home,
        crate::api::home::spec,
        crate::api::jobs::list_jobs,
        crate::api::jobs::create_job,
        crate::api::jobs::get_job,
        crate::api::jobs::update_job,
        crate::api::jobs::delete_job,
    ),
    components(schemas(
        crate::api::jobs::CommittedResponse,
        crate::api::jobs::JobLink,
        crate::api::jobs::JobsPage,
    )),
)]
pub struct ApiDoc;
