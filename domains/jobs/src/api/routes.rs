//! Route definitions for the Jobs domain API

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{assets, jobs, projects};
use super::middleware::JobsState;

/// Create all Jobs domain API routes
pub fn routes() -> Router<JobsState> {
    Router::new()
        .route("/v1/projects", post(projects::create_project))
        .route("/v1/projects/{project_id}", get(projects::get_project))
        .route("/v1/projects/{project_id}/jobs", post(jobs::start_job))
        .route("/v1/jobs/{job_id}", get(jobs::get_job))
        .route("/v1/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/v1/jobs/{job_id}/retry", post(jobs::retry_job))
        .route("/v1/jobs/{job_id}/events", get(jobs::stream_job_events))
        .route("/v1/assets", get(assets::list_assets))
        .route("/v1/assets/{asset_id}", get(assets::get_asset))
}
