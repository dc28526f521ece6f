//! Pipeline config endpoints.
//!
//! Reads return the config with its version in [`CONFIG_ID_HEADER`]. Writes
//! must send back the version they were based on and fail if the stored
//! config has moved on since.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use conveyor_config::validate_config;
use conveyor_core::{Config, ConfigVersion};
use tracing::{error, info};

use crate::AppState;
use crate::auth::Authenticated;
use crate::error::ApiError;

/// Header carrying the config version for optimistic concurrency.
pub const CONFIG_ID_HEADER: &str = "X-Conveyor-Config-ID";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config", get(get_default_config).put(save_default_config))
        .route(
            "/pipelines/{pipeline}/config",
            get(get_config).put(save_config),
        )
}

async fn get_default_config(
    _: Authenticated,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let pipeline = state.default_pipeline.clone();
    load(&state, &pipeline).await
}

async fn get_config(
    _: Authenticated,
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
) -> Result<Response, ApiError> {
    load(&state, &pipeline).await
}

async fn save_default_config(
    _: Authenticated,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let pipeline = state.default_pipeline.clone();
    save(&state, &pipeline, &headers, &body).await
}

async fn save_config(
    _: Authenticated,
    State(state): State<AppState>,
    Path(pipeline): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    save(&state, &pipeline, &headers, &body).await
}

async fn load(state: &AppState, pipeline: &str) -> Result<Response, ApiError> {
    let (config, version) = state.configs.get_config(pipeline).await.map_err(|e| {
        error!(pipeline = %pipeline, error = %e, "Failed to load config");
        ApiError::Internal(format!("failed to load config: {}", e))
    })?;

    Ok(([(CONFIG_ID_HEADER, version.to_string())], Json(config)).into_response())
}

async fn save(
    state: &AppState,
    pipeline: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let expected = config_id(headers)?;

    let config: Config = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("malformed config: {}", e)))?;
    validate_config(&config).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let version = state
        .configs
        .save_config(pipeline, &config, expected)
        .await
        .map_err(|e| {
            error!(pipeline = %pipeline, error = %e, "Failed to save config");
            ApiError::Internal(format!("failed to save config: {}", e))
        })?;

    info!(pipeline = %pipeline, config_version = %version, "Saved config");
    Ok([(CONFIG_ID_HEADER, version.to_string())].into_response())
}

fn config_id(headers: &HeaderMap) -> Result<ConfigVersion, ApiError> {
    let value = headers
        .get(CONFIG_ID_HEADER)
        .ok_or_else(|| ApiError::BadRequest("no config ID specified".to_string()))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::BadRequest("config ID is malformed: expected integer".to_string()))
}
