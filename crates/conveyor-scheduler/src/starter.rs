//! Build starting.

use conveyor_core::{JobConfig, Lease, ResourceConfig, ResourceType, VersionStore};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{Failure, Resolver, SchedulerError, SchedulerResult};

/// Serial lock keys for a job: its own key plus one per serial group.
pub fn lock_keys(pipeline: &str, job: &JobConfig) -> Vec<String> {
    let mut keys = vec![job_key(pipeline, &job.name)];
    keys.extend(
        job.serial_groups
            .iter()
            .map(|g| format!("{}/serial-groups/{}", pipeline, g)),
    );
    keys.sort();
    keys.dedup();
    keys
}

pub(crate) fn job_key(pipeline: &str, job: &str) -> String {
    format!("{}/jobs/{}", pipeline, job)
}

/// Moves pending builds of one pipeline to started.
pub struct BuildStarter {
    pipeline: String,
    store: Arc<dyn VersionStore>,
    resolver: Resolver,
    base_resource_types: Vec<String>,
}

impl BuildStarter {
    pub fn new(
        pipeline: impl Into<String>,
        store: Arc<dyn VersionStore>,
        base_resource_types: Vec<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            resolver: Resolver::new(store.clone()),
            store,
            base_resource_types,
        }
    }

    /// Attempt every job, concurrently. Jobs that fail do not stop the
    /// others; their errors come back together once all jobs are done.
    pub async fn try_start_all_pending_builds(
        &self,
        jobs: &[JobConfig],
        resources: &[ResourceConfig],
        resource_types: &[ResourceType],
    ) -> SchedulerResult<()> {
        let results = join_all(
            jobs.iter()
                .map(|job| self.try_start_pending_builds_for_job(job, resources, resource_types)),
        )
        .await;

        let failures: Vec<Failure> = jobs
            .iter()
            .zip(results)
            .filter_map(|(job, result)| result.err().map(|e| Failure::new(&job.name, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                error!(
                    pipeline = %self.pipeline,
                    job = %failure.name,
                    error = %failure.error,
                    "Failed to start pending builds"
                );
            }
            Err(SchedulerError::JobsFailed(failures))
        }
    }

    /// Start as many of `job`'s pending builds as its in-flight budget allows,
    /// oldest first, stopping at the first one that cannot resolve.
    pub async fn try_start_pending_builds_for_job(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
        resource_types: &[ResourceType],
    ) -> SchedulerResult<()> {
        self.check_references(job, resources, resource_types)?;

        let keys = lock_keys(&self.pipeline, job);
        let Some(lease) = self.store.acquire_serial_lock(&keys).await? else {
            debug!(pipeline = %self.pipeline, job = %job.name, ?keys, "Serial lock held elsewhere");
            return Ok(());
        };

        let result = self.start_locked(job, resources).await;
        release(lease, &self.pipeline, &job.name, result).await
    }

    async fn start_locked(&self, job: &JobConfig, resources: &[ResourceConfig]) -> SchedulerResult<()> {
        let pending = self.store.pending_builds(&job.name).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let budget = match job.max_in_flight() {
            Some(max) => {
                let running = if job.serial_groups.is_empty() {
                    self.store.running_builds(&job.name).await?
                } else {
                    self.store
                        .running_builds_by_serial_group(&job.name, &job.serial_groups)
                        .await?
                };
                (max as usize).saturating_sub(running.len())
            }
            None => pending.len(),
        };

        if budget == 0 {
            debug!(pipeline = %self.pipeline, job = %job.name, "Max in flight reached");
            return Ok(());
        }

        for build in pending.iter().take(budget) {
            let Some(inputs) = self.resolver.resolve(job, resources).await? else {
                debug!(
                    pipeline = %self.pipeline,
                    job = %job.name,
                    build_id = %build.id,
                    "Inputs not yet satisfiable"
                );
                break;
            };

            if self.store.start_build(build.id, &inputs).await? {
                info!(
                    pipeline = %self.pipeline,
                    job = %job.name,
                    build_id = %build.id,
                    number = build.number,
                    "Started build"
                );
            } else {
                debug!(
                    pipeline = %self.pipeline,
                    job = %job.name,
                    build_id = %build.id,
                    "Build already started elsewhere"
                );
            }
        }

        Ok(())
    }

    fn check_references(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
        resource_types: &[ResourceType],
    ) -> SchedulerResult<()> {
        for input in &job.inputs {
            let resource = resources
                .iter()
                .find(|r| r.name == input.resource)
                .ok_or_else(|| SchedulerError::UndeclaredResource {
                    job: job.name.clone(),
                    input: input.name().to_string(),
                    resource: input.resource.clone(),
                })?;
            self.check_type(job, resource, resource_types)?;
        }

        for output in &job.outputs {
            let resource = resources
                .iter()
                .find(|r| r.name == output.resource)
                .ok_or_else(|| SchedulerError::UndeclaredOutput {
                    job: job.name.clone(),
                    resource: output.resource.clone(),
                })?;
            self.check_type(job, resource, resource_types)?;
        }

        Ok(())
    }

    fn check_type(
        &self,
        job: &JobConfig,
        resource: &ResourceConfig,
        resource_types: &[ResourceType],
    ) -> SchedulerResult<()> {
        let known = resource_types
            .iter()
            .any(|t| t.name == resource.resource_type)
            || self.base_resource_types.contains(&resource.resource_type);

        if known {
            Ok(())
        } else {
            Err(SchedulerError::UndeclaredResourceType {
                job: job.name.clone(),
                resource: resource.name.clone(),
                resource_type: resource.resource_type.clone(),
            })
        }
    }
}

/// Release a lease, keeping the first error if both the work and the release
/// failed.
pub(crate) async fn release<T>(
    lease: Box<dyn Lease>,
    pipeline: &str,
    job: &str,
    result: SchedulerResult<T>,
) -> SchedulerResult<T> {
    match lease.release().await {
        Ok(()) => result,
        Err(e) => {
            warn!(pipeline = %pipeline, job = %job, error = %e, "Failed to release serial lock");
            result.and(Err(e.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_config::parse_config;
    use conveyor_core::{BuildStatus, Config, Version};
    use conveyor_db::MemoryStore;

    fn version(v: &str) -> Version {
        Version::from([("ref".to_string(), v.to_string())])
    }

    fn base_types() -> Vec<String> {
        vec!["git".to_string(), "registry-image".to_string()]
    }

    async fn setup(kdl: &str) -> (MemoryStore, Config, BuildStarter) {
        let config = parse_config(kdl).unwrap();
        let store = MemoryStore::new("main");
        store.set_config(config.clone()).await;
        let starter = BuildStarter::new("main", Arc::new(store.clone()), base_types());
        (store, config, starter)
    }

    async fn tick(starter: &BuildStarter, config: &Config) -> SchedulerResult<()> {
        starter
            .try_start_all_pending_builds(&config.jobs, &config.resources, &config.resource_types)
            .await
    }

    async fn statuses(store: &MemoryStore, job: &str) -> Vec<BuildStatus> {
        store.builds(job).await.into_iter().map(|b| b.status).collect()
    }

    #[test]
    fn test_lock_keys() {
        let job = JobConfig {
            name: "deploy".to_string(),
            serial_groups: vec!["prod".to_string(), "db".to_string(), "prod".to_string()],
            ..Default::default()
        };
        assert_eq!(
            lock_keys("main", &job),
            vec!["main/jobs/deploy", "main/serial-groups/db", "main/serial-groups/prod"]
        );
    }

    #[tokio::test]
    async fn test_second_tick_is_a_no_op() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "build" {
                get "repo" trigger=#true
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        let v2 = store.save_version("repo", version("v2")).await;
        let pending = store.create_pending_build("build").await.unwrap();

        tick(&starter, &config).await.unwrap();

        let started = store.build(pending.id).await.unwrap();
        assert_eq!(started.status, BuildStatus::Started);
        assert_eq!(started.input("repo").unwrap().version, v2);

        tick(&starter, &config).await.unwrap();
        assert_eq!(store.build(pending.id).await.unwrap(), started);
        assert!(store.held_locks().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsatisfiable_build_blocks_newer_ones() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "unit" {
                get "repo"
            }
            job "deploy" serial=#true {
                get "repo" passed="unit"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        store.create_pending_build("deploy").await.unwrap();
        store.create_pending_build("deploy").await.unwrap();

        tick(&starter, &config).await.unwrap();

        assert_eq!(
            statuses(&store, "deploy").await,
            vec![BuildStatus::Pending, BuildStatus::Pending]
        );
    }

    #[tokio::test]
    async fn test_serial_job_starts_one_build_per_tick() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "deploy" serial=#true {
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        let first = store.create_pending_build("deploy").await.unwrap();
        store.create_pending_build("deploy").await.unwrap();

        tick(&starter, &config).await.unwrap();
        assert_eq!(
            statuses(&store, "deploy").await,
            vec![BuildStatus::Started, BuildStatus::Pending]
        );

        // Still running, so the second one waits.
        tick(&starter, &config).await.unwrap();
        assert_eq!(
            statuses(&store, "deploy").await,
            vec![BuildStatus::Started, BuildStatus::Pending]
        );

        store.set_build_status(first.id, BuildStatus::Succeeded).await;
        tick(&starter, &config).await.unwrap();
        assert_eq!(
            statuses(&store, "deploy").await,
            vec![BuildStatus::Succeeded, BuildStatus::Started]
        );
    }

    #[tokio::test]
    async fn test_max_in_flight_limits_starts() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "unit" max-in-flight=2 {
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        for _ in 0..3 {
            store.create_pending_build("unit").await.unwrap();
        }

        tick(&starter, &config).await.unwrap();
        assert_eq!(
            statuses(&store, "unit").await,
            vec![BuildStatus::Started, BuildStatus::Started, BuildStatus::Pending]
        );
    }

    #[tokio::test]
    async fn test_serial_job_ignores_larger_max_in_flight() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "deploy" serial=#true max-in-flight=3 {
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        for _ in 0..3 {
            store.create_pending_build("deploy").await.unwrap();
        }

        tick(&starter, &config).await.unwrap();
        assert_eq!(
            statuses(&store, "deploy").await,
            vec![BuildStatus::Started, BuildStatus::Pending, BuildStatus::Pending]
        );
    }

    #[tokio::test]
    async fn test_serial_group_ignores_larger_max_in_flight() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "a" max-in-flight=2 {
                serial-groups "prod"
                get "repo"
            }
            job "b" max-in-flight=2 {
                serial-groups "prod"
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        store.create_pending_build("a").await.unwrap();
        store.create_pending_build("a").await.unwrap();
        store.create_pending_build("b").await.unwrap();

        tick(&starter, &config).await.unwrap();

        let running = store
            .running_builds_by_serial_group("a", &["prod".to_string()])
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(
            statuses(&store, "a").await.iter().filter(|s| **s == BuildStatus::Started).count()
                + statuses(&store, "b").await.iter().filter(|s| **s == BuildStatus::Started).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unbounded_job_starts_everything() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "unit" {
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        for _ in 0..3 {
            store.create_pending_build("unit").await.unwrap();
        }

        tick(&starter, &config).await.unwrap();
        assert_eq!(statuses(&store, "unit").await, vec![BuildStatus::Started; 3]);
    }

    #[tokio::test]
    async fn test_lock_contention_skips_job() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "deploy" {
                serial-groups "prod"
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        store.create_pending_build("deploy").await.unwrap();

        let held = store
            .acquire_serial_lock(&["main/serial-groups/prod".to_string()])
            .await
            .unwrap()
            .unwrap();

        tick(&starter, &config).await.unwrap();
        assert_eq!(statuses(&store, "deploy").await, vec![BuildStatus::Pending]);

        held.release().await.unwrap();
        tick(&starter, &config).await.unwrap();
        assert_eq!(statuses(&store, "deploy").await, vec![BuildStatus::Started]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serial_group_never_runs_two_builds() {
        let (store, config, _) = setup(
            r#"
            resource "repo" type="git"
            job "deploy-a" {
                serial-groups "prod"
                get "repo"
            }
            job "deploy-b" {
                serial-groups "prod"
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        store.create_pending_build("deploy-a").await.unwrap();
        store.create_pending_build("deploy-b").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let starter = BuildStarter::new("main", Arc::new(store), base_types());
                tick(&starter, &config).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let running = store
            .running_builds_by_serial_group("deploy-a", &["prod".to_string()])
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_block_others() {
        for order in [["broken", "healthy"], ["healthy", "broken"]] {
            let (store, mut config, starter) = setup(
                r#"
                resource "repo" type="git"
                job "healthy" {
                    get "repo"
                }
                job "broken" {
                    get "repo"
                }
                "#,
            )
            .await;
            // Point "broken" at a resource the pipeline never declared.
            config.jobs.iter_mut().find(|j| j.name == "broken").unwrap().inputs[0].resource =
                "missing".to_string();
            config
                .jobs
                .sort_by_key(|j| order.iter().position(|name| *name == j.name));

            store.save_version("repo", version("v1")).await;
            store.create_pending_build("healthy").await.unwrap();
            store.create_pending_build("broken").await.unwrap();

            let err = tick(&starter, &config).await.unwrap_err();
            assert!(err.to_string().contains("broken"));
            assert!(!err.to_string().contains("healthy"));
            assert_eq!(statuses(&store, "healthy").await, vec![BuildStatus::Started]);
            assert_eq!(statuses(&store, "broken").await, vec![BuildStatus::Pending]);
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_per_job() {
        let (store, config, starter) = setup(
            r#"
            resource "repo" type="git"
            job "healthy" {
                get "repo"
            }
            job "flaky" {
                get "repo"
            }
            "#,
        )
        .await;
        store.save_version("repo", version("v1")).await;
        store.create_pending_build("healthy").await.unwrap();
        store.fail_job("flaky").await;

        let err = tick(&starter, &config).await.unwrap_err();
        match err {
            SchedulerError::JobsFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].name, "flaky");
                assert!(matches!(failures[0].error, SchedulerError::Store(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(statuses(&store, "healthy").await, vec![BuildStatus::Started]);
        assert!(store.held_locks().await.is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_resource_type() {
        let (store, config, starter) = setup(
            r#"
            resource "bucket" type="s3"
            job "upload" {
                put "bucket"
            }
            "#,
        )
        .await;
        store.create_pending_build("upload").await.unwrap();

        let err = tick(&starter, &config).await.unwrap_err();
        assert!(err.to_string().contains("undeclared type 's3'"));
        assert!(store.held_locks().await.is_empty());
    }
}
