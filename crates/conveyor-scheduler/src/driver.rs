//! Periodic scheduling across every pipeline.

use conveyor_core::{ConfigStore, PipelineStores};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::{BuildStarter, BuildTrigger, Failure, SchedulerError, SchedulerResult};

/// Ticks every saved pipeline on an interval.
pub struct TickDriver {
    configs: Arc<dyn ConfigStore>,
    stores: Arc<dyn PipelineStores>,
    interval: Duration,
    base_resource_types: Arc<Vec<String>>,
}

impl TickDriver {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        stores: Arc<dyn PipelineStores>,
        interval: Duration,
        base_resource_types: Vec<String>,
    ) -> Self {
        Self {
            configs,
            stores,
            interval,
            base_resource_types: Arc::new(base_resource_types),
        }
    }

    /// Run the tick loop. Failed ticks are logged and never end the loop.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs_f64(), "Starting scheduler");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick_once().await {
                error!(error = %e, "Scheduler tick failed");
            }
        }
    }

    /// One pass over every pipeline, each in its own task.
    pub async fn tick_once(&self) -> SchedulerResult<()> {
        let pipelines = self.configs.list_pipelines().await?;

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for pipeline in pipelines {
            let configs = self.configs.clone();
            let stores = self.stores.clone();
            let base_resource_types = self.base_resource_types.clone();
            let name = pipeline.clone();
            let handle = tasks.spawn(async move {
                tick_pipeline(&pipeline, configs, stores, &base_resource_types).await
            });
            names.insert(handle.id(), name);
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    let pipeline = names.remove(&id).unwrap_or_default();
                    failures.push(Failure::new(pipeline, e));
                }
                Err(e) => {
                    let pipeline = names.remove(&e.id()).unwrap_or_default();
                    error!(pipeline = %pipeline, error = %e, "Pipeline tick task panicked");
                    failures.push(Failure::new(pipeline, e.into()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by(|a, b| a.name.cmp(&b.name));
            Err(SchedulerError::PipelinesFailed(failures))
        }
    }
}

/// Trigger then start builds for one pipeline from a fresh config read.
async fn tick_pipeline(
    pipeline: &str,
    configs: Arc<dyn ConfigStore>,
    stores: Arc<dyn PipelineStores>,
    base_resource_types: &[String],
) -> SchedulerResult<()> {
    let (config, version) = configs.get_config(pipeline).await?;
    debug!(pipeline = %pipeline, config_version = %version, jobs = config.jobs.len(), "Ticking pipeline");

    let store = stores.for_pipeline(pipeline).await?;
    let mut failures = Vec::new();

    let trigger = BuildTrigger::new(pipeline, store.clone());
    for job in &config.jobs {
        if let Err(e) = trigger.try_trigger(job, &config.resources).await {
            error!(pipeline = %pipeline, job = %job.name, error = %e, "Failed to trigger build");
            failures.push(Failure::new(&job.name, e));
        }
    }

    let starter = BuildStarter::new(pipeline, store, base_resource_types.to_vec());
    match starter
        .try_start_all_pending_builds(&config.jobs, &config.resources, &config.resource_types)
        .await
    {
        Ok(()) => {}
        Err(SchedulerError::JobsFailed(mut job_failures)) => failures.append(&mut job_failures),
        Err(e) => return Err(e),
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(SchedulerError::JobsFailed(failures))
    }
}
