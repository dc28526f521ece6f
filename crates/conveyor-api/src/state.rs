//! Application state.

use conveyor_config::SystemConfig;
use conveyor_core::{ConfigStore, PipelineStores};
use conveyor_db::{PgConfigRepo, PgPipelineStores};
use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::{self, AuthValidator};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub configs: Arc<dyn ConfigStore>,
    pub stores: Arc<dyn PipelineStores>,
    pub auth: Arc<dyn AuthValidator>,
    /// Pipeline served by the unscoped config endpoint.
    pub default_pipeline: String,
}

impl AppState {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        stores: Arc<dyn PipelineStores>,
        auth: Arc<dyn AuthValidator>,
        default_pipeline: impl Into<String>,
    ) -> Self {
        Self {
            configs,
            stores,
            auth,
            default_pipeline: default_pipeline.into(),
        }
    }

    /// State backed by Postgres.
    pub fn from_pool(pool: PgPool, config: &SystemConfig) -> Self {
        Self::new(
            Arc::new(PgConfigRepo::new(pool.clone())),
            Arc::new(PgPipelineStores::new(pool, config.lock_lease)),
            auth::validator(config.auth_token.clone()),
            config.default_pipeline.clone(),
        )
    }
}
