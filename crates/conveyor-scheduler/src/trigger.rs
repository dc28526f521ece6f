//! Automatic build creation for trigger inputs.

use conveyor_core::{Build, JobConfig, ResourceConfig, VersionStore};
use std::sync::Arc;
use tracing::{debug, info};

use crate::starter::{job_key, release};
use crate::{Resolver, SchedulerResult};

/// Creates a pending build when a `trigger` input resolves to a version the
/// job has not built yet.
pub struct BuildTrigger {
    pipeline: String,
    store: Arc<dyn VersionStore>,
    resolver: Resolver,
}

impl BuildTrigger {
    pub fn new(pipeline: impl Into<String>, store: Arc<dyn VersionStore>) -> Self {
        Self {
            pipeline: pipeline.into(),
            resolver: Resolver::new(store.clone()),
            store,
        }
    }

    /// Returns the build it created, if any.
    pub async fn try_trigger(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> SchedulerResult<Option<Build>> {
        if !job.has_trigger_input() {
            return Ok(None);
        }

        let keys = [job_key(&self.pipeline, &job.name)];
        let Some(lease) = self.store.acquire_serial_lock(&keys).await? else {
            debug!(pipeline = %self.pipeline, job = %job.name, "Job lock held elsewhere");
            return Ok(None);
        };

        let result = self.trigger_locked(job, resources).await;
        release(lease, &self.pipeline, &job.name, result).await
    }

    async fn trigger_locked(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> SchedulerResult<Option<Build>> {
        if !self.store.pending_builds(&job.name).await?.is_empty() {
            return Ok(None);
        }

        let Some(resolved) = self.resolver.resolve(job, resources).await? else {
            return Ok(None);
        };

        let latest = self.store.latest_build(&job.name).await?;
        let changed: Vec<&str> = job
            .inputs
            .iter()
            .filter(|input| input.trigger)
            .filter_map(|input| {
                let now = resolved.iter().find(|r| r.name == input.name())?;
                let before = latest.as_ref().and_then(|b| b.input(input.name()));
                match before {
                    Some(before) if before.version.sequence == now.version.sequence => None,
                    _ => Some(input.name()),
                }
            })
            .collect();

        if changed.is_empty() {
            return Ok(None);
        }

        let build = self.store.create_pending_build(&job.name).await?;
        info!(
            pipeline = %self.pipeline,
            job = %job.name,
            build_id = %build.id,
            number = build.number,
            inputs = ?changed,
            "Triggered build"
        );
        Ok(Some(build))
    }
}
