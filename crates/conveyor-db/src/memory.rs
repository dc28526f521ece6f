//! In-memory store.
//!
//! Implements every store trait over shared state behind one mutex, with the
//! same ordering and compare-and-swap semantics as the Postgres store. Clones
//! share state; [`MemoryStore::for_pipeline`] hands out clones scoped to
//! another pipeline. Serial locks never expire here.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::{
    Build, BuildId, BuildStatus, BuildVersions, Config, ConfigStore, ConfigVersion, Error, Lease,
    PipelineStores, ResolvedInput, ResourceVersion, Result, Version, VersionStore,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    configs: HashMap<String, (Config, ConfigVersion)>,
    pipelines: HashMap<String, PipelineState>,
    locks: HashMap<String, u64>,
    failing_jobs: HashSet<String>,
    next_sequence: i64,
    next_build_id: i64,
    next_holder: u64,
}

#[derive(Debug, Default)]
struct PipelineState {
    versions: Vec<ResourceVersion>,
    builds: Vec<BuildRecord>,
}

#[derive(Debug)]
struct BuildRecord {
    build: Build,
    outputs: Vec<i64>,
}

impl PipelineState {
    fn version(&self, sequence: i64) -> Option<&ResourceVersion> {
        self.versions.iter().find(|v| v.sequence == sequence)
    }

    fn builds_of<'a>(
        &'a self,
        jobs: &'a [String],
        status: BuildStatus,
    ) -> impl Iterator<Item = &'a Build> + 'a {
        self.builds
            .iter()
            .map(|r| &r.build)
            .filter(move |b| b.status == status && jobs.contains(&b.job_name))
    }
}

impl State {
    fn pipeline(&mut self, name: &str) -> &mut PipelineState {
        self.pipelines.entry(name.to_string()).or_default()
    }

    fn check_job(&self, job: &str) -> Result<()> {
        if self.failing_jobs.contains(job) {
            return Err(Error::Storage(format!("reads for job '{}' are failing", job)));
        }
        Ok(())
    }
}

/// Shared in-memory store scoped to one pipeline.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    pipeline: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            state: Arc::default(),
        }
    }

    /// A store over the same state, scoped to `pipeline`.
    pub fn scoped(&self, pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            state: self.state.clone(),
        }
    }

    /// Replace this pipeline's config, bumping its version.
    pub async fn set_config(&self, config: Config) -> ConfigVersion {
        let mut state = self.state.lock().await;
        let version = state
            .configs
            .get(&self.pipeline)
            .map(|(_, v)| v.next())
            .unwrap_or_else(|| ConfigVersion::new(1));
        state.configs.insert(self.pipeline.clone(), (config, version));
        state.pipeline(&self.pipeline);
        version
    }

    /// Record a discovered version. Saving known metadata again returns the
    /// existing record.
    pub async fn save_version(&self, resource: &str, version: Version) -> ResourceVersion {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .pipeline(&self.pipeline)
            .versions
            .iter()
            .find(|v| v.resource == resource && v.version == version)
        {
            return existing.clone();
        }

        state.next_sequence += 1;
        let saved = ResourceVersion {
            resource: resource.to_string(),
            sequence: state.next_sequence,
            version,
            enabled: true,
        };
        state.pipeline(&self.pipeline).versions.push(saved.clone());
        saved
    }

    pub async fn set_version_enabled(&self, sequence: i64, enabled: bool) {
        let mut state = self.state.lock().await;
        if let Some(version) = state
            .pipeline(&self.pipeline)
            .versions
            .iter_mut()
            .find(|v| v.sequence == sequence)
        {
            version.enabled = enabled;
        }
    }

    /// Record a build that already ran, with the versions it consumed and
    /// produced. Inputs are named after their resources.
    pub async fn record_build(
        &self,
        job: &str,
        status: BuildStatus,
        inputs: &[ResourceVersion],
        outputs: &[ResourceVersion],
    ) -> Build {
        let inputs = inputs
            .iter()
            .map(|v| ResolvedInput {
                name: v.resource.clone(),
                resource: v.resource.clone(),
                version: v.clone(),
                params: Default::default(),
            })
            .collect();

        let mut state = self.state.lock().await;
        let mut build = new_build(&mut state, &self.pipeline, job);
        build.status = status;
        build.is_scheduled = status != BuildStatus::Pending;
        if status != BuildStatus::Pending {
            build.started_at = Some(Utc::now());
        }
        build.inputs = inputs;

        state.pipeline(&self.pipeline).builds.push(BuildRecord {
            build: build.clone(),
            outputs: outputs.iter().map(|v| v.sequence).collect(),
        });
        build
    }

    pub async fn set_build_status(&self, id: BuildId, status: BuildStatus) {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .pipeline(&self.pipeline)
            .builds
            .iter_mut()
            .find(|r| r.build.id == id)
        {
            record.build.status = status;
        }
    }

    pub async fn build(&self, id: BuildId) -> Option<Build> {
        let mut state = self.state.lock().await;
        state
            .pipeline(&self.pipeline)
            .builds
            .iter()
            .find(|r| r.build.id == id)
            .map(|r| r.build.clone())
    }

    /// Every build of `job`, oldest first.
    pub async fn builds(&self, job: &str) -> Vec<Build> {
        let mut state = self.state.lock().await;
        state
            .pipeline(&self.pipeline)
            .builds
            .iter()
            .filter(|r| r.build.job_name == job)
            .map(|r| r.build.clone())
            .collect()
    }

    /// Make every build read for `job` fail with a storage error.
    pub async fn fail_job(&self, job: &str) {
        self.state.lock().await.failing_jobs.insert(job.to_string());
    }

    /// Keys currently held, sorted.
    pub async fn held_locks(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state.locks.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn new_build(state: &mut State, pipeline: &str, job: &str) -> Build {
    state.next_build_id += 1;
    let id = BuildId::new(state.next_build_id);
    let number = state
        .pipeline(pipeline)
        .builds
        .iter()
        .filter(|r| r.build.job_name == job)
        .map(|r| r.build.number)
        .max()
        .unwrap_or(0)
        + 1;

    Build {
        id,
        job_name: job.to_string(),
        number,
        status: BuildStatus::Pending,
        is_scheduled: false,
        created_at: Utc::now(),
        started_at: None,
        inputs: Vec::new(),
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.configs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_config(&self, pipeline: &str) -> Result<(Config, ConfigVersion)> {
        let state = self.state.lock().await;
        Ok(state.configs.get(pipeline).cloned().unwrap_or_default())
    }

    async fn save_config(
        &self,
        pipeline: &str,
        config: &Config,
        expected: ConfigVersion,
    ) -> Result<ConfigVersion> {
        let mut state = self.state.lock().await;
        let found = state
            .configs
            .get(pipeline)
            .map(|(_, v)| *v)
            .unwrap_or_default();
        if found != expected {
            return Err(Error::Conflict(format!(
                "config version mismatch: expected {}, found {}",
                expected, found
            )));
        }

        let next = expected.next();
        state
            .configs
            .insert(pipeline.to_string(), (config.clone(), next));
        state.pipeline(pipeline);
        Ok(next)
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn latest_version(&self, resource: &str) -> Result<Option<ResourceVersion>> {
        let mut state = self.state.lock().await;
        Ok(state
            .pipeline(&self.pipeline)
            .versions
            .iter()
            .filter(|v| v.resource == resource && v.enabled)
            .max_by_key(|v| v.sequence)
            .cloned())
    }

    async fn versions_used_by_successful_builds(&self, job: &str) -> Result<Vec<BuildVersions>> {
        let mut state = self.state.lock().await;
        state.check_job(job)?;
        let pipeline = state.pipeline(&self.pipeline);

        let mut result = Vec::new();
        for record in &pipeline.builds {
            if record.build.job_name != job || record.build.status != BuildStatus::Succeeded {
                continue;
            }

            let mut sequences: Vec<i64> = record
                .build
                .inputs
                .iter()
                .map(|i| i.version.sequence)
                .chain(record.outputs.iter().copied())
                .collect();
            sequences.sort_unstable();
            sequences.dedup();

            result.push(BuildVersions {
                build_id: record.build.id,
                versions: sequences
                    .into_iter()
                    .filter_map(|s| pipeline.version(s).cloned())
                    .collect(),
            });
        }
        Ok(result)
    }

    async fn pending_builds(&self, job: &str) -> Result<Vec<Build>> {
        let mut state = self.state.lock().await;
        state.check_job(job)?;
        let jobs = [job.to_string()];
        Ok(state
            .pipeline(&self.pipeline)
            .builds_of(&jobs, BuildStatus::Pending)
            .cloned()
            .collect())
    }

    async fn running_builds(&self, job: &str) -> Result<Vec<Build>> {
        let mut state = self.state.lock().await;
        state.check_job(job)?;
        let jobs = [job.to_string()];
        Ok(state
            .pipeline(&self.pipeline)
            .builds_of(&jobs, BuildStatus::Started)
            .cloned()
            .collect())
    }

    async fn running_builds_by_serial_group(
        &self,
        job: &str,
        groups: &[String],
    ) -> Result<Vec<Build>> {
        let mut state = self.state.lock().await;
        state.check_job(job)?;

        let mut jobs = state
            .configs
            .get(&self.pipeline)
            .map(|(config, _)| config.jobs_in_serial_groups(groups))
            .unwrap_or_default();
        if !jobs.iter().any(|j| j == job) {
            jobs.push(job.to_string());
        }

        Ok(state
            .pipeline(&self.pipeline)
            .builds_of(&jobs, BuildStatus::Started)
            .cloned()
            .collect())
    }

    async fn latest_build(&self, job: &str) -> Result<Option<Build>> {
        let mut state = self.state.lock().await;
        state.check_job(job)?;
        Ok(state
            .pipeline(&self.pipeline)
            .builds
            .iter()
            .rev()
            .map(|r| &r.build)
            .find(|b| b.job_name == job && b.status != BuildStatus::Pending)
            .cloned())
    }

    async fn create_pending_build(&self, job: &str) -> Result<Build> {
        let mut state = self.state.lock().await;
        let build = new_build(&mut state, &self.pipeline, job);
        state.pipeline(&self.pipeline).builds.push(BuildRecord {
            build: build.clone(),
            outputs: Vec::new(),
        });
        Ok(build)
    }

    async fn start_build(&self, build: BuildId, inputs: &[ResolvedInput]) -> Result<bool> {
        let mut state = self.state.lock().await;
        let record = state
            .pipeline(&self.pipeline)
            .builds
            .iter_mut()
            .find(|r| r.build.id == build)
            .ok_or_else(|| Error::NotFound(format!("build {}", build)))?;

        if record.build.status != BuildStatus::Pending {
            return Ok(false);
        }

        record.build.status = BuildStatus::Started;
        record.build.is_scheduled = true;
        record.build.started_at = Some(Utc::now());
        record.build.inputs = inputs.to_vec();
        Ok(true)
    }

    async fn acquire_serial_lock(&self, keys: &[String]) -> Result<Option<Box<dyn Lease>>> {
        let mut state = self.state.lock().await;
        if keys.iter().any(|k| state.locks.contains_key(k)) {
            return Ok(None);
        }

        state.next_holder += 1;
        let holder = state.next_holder;
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        for key in &keys {
            state.locks.insert(key.clone(), holder);
        }

        Ok(Some(Box::new(MemoryLease {
            state: self.state.clone(),
            keys,
            holder,
        })))
    }
}

#[async_trait]
impl PipelineStores for MemoryStore {
    async fn for_pipeline(&self, pipeline: &str) -> Result<Arc<dyn VersionStore>> {
        Ok(Arc::new(self.scoped(pipeline)))
    }
}

struct MemoryLease {
    state: Arc<Mutex<State>>,
    keys: Vec<String>,
    holder: u64,
}

#[async_trait]
impl Lease for MemoryLease {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in &self.keys {
            if state.locks.get(key) == Some(&self.holder) {
                state.locks.remove(key);
            }
        }
        Ok(())
    }
}
