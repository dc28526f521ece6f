//! Manual build triggering.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use conveyor_core::Build;
use tracing::info;

use crate::AppState;
use crate::auth::Authenticated;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/pipelines/{pipeline}/jobs/{job}/builds", post(create_build))
}

/// Queue a pending build. The scheduler starts it on a later tick.
async fn create_build(
    _: Authenticated,
    State(state): State<AppState>,
    Path((pipeline, job)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    let (config, _) = state.configs.get_config(&pipeline).await?;
    if config.find_job(&job).is_none() {
        return Err(ApiError::NotFound(format!(
            "job '{}' not found in pipeline '{}'",
            job, pipeline
        )));
    }

    let store = state.stores.for_pipeline(&pipeline).await?;
    let build = store.create_pending_build(&job).await?;
    info!(pipeline = %pipeline, job = %job, build_id = %build.id, number = build.number, "Created build");

    Ok((StatusCode::CREATED, Json(build)))
}
