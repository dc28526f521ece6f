//! Store capability traits.
//!
//! The scheduler holds no state of its own. Everything it decides is
//! recomputed from these reads on every tick, and the only writes it makes
//! go through [`VersionStore::start_build`] and
//! [`VersionStore::create_pending_build`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::{Build, BuildId, BuildVersions, Config, ConfigVersion, ResolvedInput, ResourceVersion};
use crate::Result;

/// Saved pipeline configs with optimistic versioning.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Names of every pipeline with a saved config.
    async fn list_pipelines(&self) -> Result<Vec<String>>;

    /// Load a pipeline's config. A pipeline that was never saved yields an
    /// empty config at version zero.
    async fn get_config(&self, pipeline: &str) -> Result<(Config, ConfigVersion)>;

    /// Save a config if the stored version still equals `expected`.
    ///
    /// Fails with [`crate::Error::Conflict`] when another save got there
    /// first. Returns the new version.
    async fn save_config(
        &self,
        pipeline: &str,
        config: &Config,
        expected: ConfigVersion,
    ) -> Result<ConfigVersion>;
}

/// A held serial lock. Leases expire on their own if never released.
#[async_trait]
pub trait Lease: Send + Sync {
    fn keys(&self) -> &[String];

    async fn release(self: Box<Self>) -> Result<()>;
}

/// Version and build history for one pipeline.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// The most recently discovered enabled version of a resource.
    async fn latest_version(&self, resource: &str) -> Result<Option<ResourceVersion>>;

    /// Versions used (as input or output) by each successful build of `job`,
    /// oldest build first.
    async fn versions_used_by_successful_builds(&self, job: &str) -> Result<Vec<BuildVersions>>;

    /// Pending builds of `job`, oldest first.
    async fn pending_builds(&self, job: &str) -> Result<Vec<Build>>;

    /// Started builds of `job`.
    async fn running_builds(&self, job: &str) -> Result<Vec<Build>>;

    /// Started builds of `job` and of every job sharing one of `groups`.
    async fn running_builds_by_serial_group(
        &self,
        job: &str,
        groups: &[String],
    ) -> Result<Vec<Build>>;

    /// The most recent build of `job` that has left the pending state.
    async fn latest_build(&self, job: &str) -> Result<Option<Build>>;

    async fn create_pending_build(&self, job: &str) -> Result<Build>;

    /// Move a build from pending to started and attach its inputs.
    ///
    /// Compare-and-swap on status: returns `false` without error when the
    /// build is no longer pending, e.g. another controller won the race.
    async fn start_build(&self, build: BuildId, inputs: &[ResolvedInput]) -> Result<bool>;

    /// Try to take every key at once. Never waits: `None` means some key is
    /// held elsewhere.
    async fn acquire_serial_lock(&self, keys: &[String]) -> Result<Option<Box<dyn Lease>>>;
}

/// Hands out a [`VersionStore`] scoped to one pipeline.
#[async_trait]
pub trait PipelineStores: Send + Sync {
    async fn for_pipeline(&self, pipeline: &str) -> Result<Arc<dyn VersionStore>>;
}
