//! Input version resolution.
//!
//! An input with no `passed` constraint takes the latest enabled version of
//! its resource. An input constrained by upstream jobs may only take a version
//! used by a successful build of every one of those jobs.
//!
//! Inputs that share an upstream job are resolved together: each shared job
//! contributes one of its successful builds, and every input constrained by
//! that job must take a version that build used. Upstream builds are tried
//! most recent first, so the chosen bundle is the newest one that satisfies
//! all inputs at once.

use conveyor_core::{
    BuildVersions, InputConfig, JobConfig, ResolvedInput, ResolvedInputs, ResourceConfig,
    ResourceVersion, VersionStore,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::{SchedulerError, SchedulerResult};

/// Candidate versions keyed by discovery sequence.
type Candidates = BTreeMap<i64, ResourceVersion>;

/// Successful builds of each upstream job, oldest first.
type History = HashMap<String, Vec<BuildVersions>>;

/// Picks input versions for a job's next build.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn VersionStore>,
}

impl Resolver {
    pub fn new(store: Arc<dyn VersionStore>) -> Self {
        Self { store }
    }

    /// Resolve every input of `job`.
    ///
    /// Returns `Ok(None)` when some input has no admissible version yet.
    /// Errors only on an undeclared resource or a store failure.
    pub async fn resolve(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
    ) -> SchedulerResult<Option<ResolvedInputs>> {
        for input in &job.inputs {
            if !resources.iter().any(|r| r.name == input.resource) {
                return Err(SchedulerError::UndeclaredResource {
                    job: job.name.clone(),
                    input: input.name().to_string(),
                    resource: input.resource.clone(),
                });
            }
        }

        let mut chosen: Vec<Option<ResourceVersion>> = vec![None; job.inputs.len()];

        for (idx, input) in job.inputs.iter().enumerate() {
            if !input.passed.is_empty() {
                continue;
            }
            match self.store.latest_version(&input.resource).await? {
                Some(version) => chosen[idx] = Some(version),
                None => {
                    debug!(job = %job.name, input = %input.name(), "No version yet");
                    return Ok(None);
                }
            }
        }

        let history = self.load_history(job).await?;

        for component in components(&job.inputs) {
            let picked = if let [idx] = component.as_slice() {
                let input = &job.inputs[*idx];
                latest(independent_candidates(input, &history)).map(|v| vec![v])
            } else {
                let inputs: Vec<&InputConfig> = component.iter().map(|&i| &job.inputs[i]).collect();
                BundleSearch::new(&inputs, &history)
                    .solve()
                    .and_then(|sets| sets.into_iter().map(latest).collect::<Option<Vec<_>>>())
            };

            match picked {
                Some(versions) => {
                    for (&idx, version) in component.iter().zip(versions) {
                        chosen[idx] = Some(version);
                    }
                }
                None => {
                    debug!(
                        job = %job.name,
                        inputs = ?component.iter().map(|&i| job.inputs[i].name()).collect::<Vec<_>>(),
                        "No version satisfies passed constraints"
                    );
                    return Ok(None);
                }
            }
        }

        let mut resolved = Vec::with_capacity(job.inputs.len());
        for (input, version) in job.inputs.iter().zip(chosen) {
            let Some(version) = version else {
                return Ok(None);
            };
            resolved.push(ResolvedInput {
                name: input.name().to_string(),
                resource: input.resource.clone(),
                version,
                params: input.params.clone(),
            });
        }
        Ok(Some(resolved))
    }

    async fn load_history(&self, job: &JobConfig) -> SchedulerResult<History> {
        let mut history = History::new();
        for input in &job.inputs {
            for passed in &input.passed {
                if history.contains_key(passed) {
                    continue;
                }
                let builds = self.store.versions_used_by_successful_builds(passed).await?;
                history.insert(passed.clone(), builds);
            }
        }
        Ok(history)
    }
}

/// Group constrained inputs (by index) so that inputs sharing an upstream job,
/// directly or through other inputs, land in the same group.
fn components(inputs: &[InputConfig]) -> Vec<Vec<usize>> {
    let mut groups: Vec<(Vec<usize>, BTreeSet<&str>)> = Vec::new();

    for (idx, input) in inputs.iter().enumerate() {
        if input.passed.is_empty() {
            continue;
        }

        let mut members = vec![idx];
        let mut jobs: BTreeSet<&str> = input.passed.iter().map(String::as_str).collect();
        let mut rest = Vec::with_capacity(groups.len());
        for (group_members, group_jobs) in groups.drain(..) {
            if group_jobs.is_disjoint(&jobs) {
                rest.push((group_members, group_jobs));
            } else {
                members.extend(group_members);
                jobs.extend(group_jobs);
            }
        }
        members.sort_unstable();
        rest.push((members, jobs));
        groups = rest;
    }

    let mut components: Vec<Vec<usize>> = groups.into_iter().map(|(members, _)| members).collect();
    components.sort();
    components
}

fn versions_in(build: &BuildVersions, resource: &str) -> Candidates {
    build
        .versions_of(resource)
        .map(|v| (v.sequence, v.clone()))
        .collect()
}

fn intersect(current: Option<Candidates>, next: Candidates) -> Candidates {
    match current {
        None => next,
        Some(current) => current
            .into_iter()
            .filter(|(seq, _)| next.contains_key(seq))
            .collect(),
    }
}

fn latest(candidates: Candidates) -> Option<ResourceVersion> {
    candidates.into_values().next_back()
}

/// Versions of the input's resource used by any successful build of each
/// passed job, intersected across jobs.
fn independent_candidates(input: &InputConfig, history: &History) -> Candidates {
    let mut result: Option<Candidates> = None;
    for passed in &input.passed {
        let used: Candidates = history
            .get(passed)
            .into_iter()
            .flatten()
            .flat_map(|build| versions_in(build, &input.resource))
            .collect();
        result = Some(intersect(result, used));
    }
    result.unwrap_or_default()
}

/// Backtracking search assigning one successful build to each upstream job
/// shared by a group of inputs.
struct BundleSearch<'a> {
    inputs: &'a [&'a InputConfig],
    jobs: Vec<&'a str>,
    /// Usable builds per job, most recent first.
    domains: Vec<Vec<&'a BuildVersions>>,
}

impl<'a> BundleSearch<'a> {
    fn new(inputs: &'a [&'a InputConfig], history: &'a History) -> Self {
        let mut jobs: Vec<&str> = Vec::new();
        for input in inputs {
            for passed in &input.passed {
                if !jobs.contains(&passed.as_str()) {
                    jobs.push(passed);
                }
            }
        }

        // A build is only usable if it used every resource it has to vouch for.
        let domains: Vec<Vec<&BuildVersions>> = jobs
            .iter()
            .map(|job| {
                let constrained: Vec<&str> = inputs
                    .iter()
                    .filter(|i| i.passed.iter().any(|p| p == job))
                    .map(|i| i.resource.as_str())
                    .collect();
                history
                    .get(*job)
                    .map(|builds| {
                        builds
                            .iter()
                            .rev()
                            .filter(|b| constrained.iter().all(|r| b.touches(r)))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .collect();

        Self {
            inputs,
            jobs,
            domains,
        }
    }

    /// Candidate versions per input for the first complete assignment found.
    fn solve(&self) -> Option<Vec<Candidates>> {
        let mut assigned = Vec::with_capacity(self.jobs.len());
        self.extend(&mut assigned)
    }

    fn extend(&self, assigned: &mut Vec<&'a BuildVersions>) -> Option<Vec<Candidates>> {
        let candidates = self.candidates(assigned)?;
        if assigned.len() == self.jobs.len() {
            return Some(candidates);
        }

        for &build in &self.domains[assigned.len()] {
            assigned.push(build);
            if let Some(found) = self.extend(assigned) {
                return Some(found);
            }
            assigned.pop();
        }
        None
    }

    /// Versions each input can still take under the builds assigned so far.
    /// `None` as soon as one input is left with nothing.
    fn candidates(&self, assigned: &[&BuildVersions]) -> Option<Vec<Candidates>> {
        let mut result = Vec::with_capacity(self.inputs.len());
        for input in self.inputs {
            let mut current: Option<Candidates> = None;
            for (job, build) in self.jobs.iter().zip(assigned) {
                if input.passed.iter().any(|p| p == job) {
                    current = Some(intersect(current, versions_in(build, &input.resource)));
                }
            }
            if current.as_ref().is_some_and(BTreeMap::is_empty) {
                return None;
            }
            result.push(current.unwrap_or_default());
        }
        Some(result)
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

    fn resolver(store: &MemoryStore) -> Resolver {
        Resolver::new(Arc::new(store.clone()))
    }

    async fn resolve(store: &MemoryStore, config: &Config, job: &str) -> Option<Vec<String>> {
        let job = config.find_job(job).unwrap();
        resolver(store)
            .resolve(job, &config.resources)
            .await
            .unwrap()
            .map(|inputs| {
                inputs
                    .into_iter()
                    .map(|i| format!("{}={}", i.name, i.version.version["ref"]))
                    .collect()
            })
    }

    fn two_resource_pipeline() -> Config {
        parse_config(
            r#"
            resource "r1" type="git"
            resource "r2" type="git"

            job "p" {
                get "r1"
                get "r2"
            }

            job "downstream" {
                get "r1" passed="p"
                get "r2" passed="p"
            }
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_latest_without_constraint() {
        let config = parse_config(
            r#"
            resource "repo" type="git"
            job "unit" {
                get "repo" trigger=#true
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");
        for v in ["v1", "v2", "v3"] {
            store.save_version("repo", version(v)).await;
        }

        assert_eq!(
            resolve(&store, &config, "unit").await,
            Some(vec!["repo=v3".to_string()])
        );
    }

    #[tokio::test]
    async fn test_latest_skips_disabled() {
        let config = parse_config(
            r#"
            resource "repo" type="git"
            job "unit" {
                get "repo"
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");
        store.save_version("repo", version("v1")).await;
        let v2 = store.save_version("repo", version("v2")).await;
        store.set_version_enabled(v2.sequence, false).await;

        assert_eq!(
            resolve(&store, &config, "unit").await,
            Some(vec!["repo=v1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_no_versions_is_not_an_error() {
        let config = parse_config(
            r#"
            resource "repo" type="git"
            job "unit" {
                get "repo"
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");

        assert_eq!(resolve(&store, &config, "unit").await, None);
    }

    #[tokio::test]
    async fn test_passed_inputs_come_from_one_build() {
        let config = two_resource_pipeline();
        let store = MemoryStore::new("main");
        let r1v1 = store.save_version("r1", version("v1")).await;
        let r2v1 = store.save_version("r2", version("v1")).await;
        let r1v2 = store.save_version("r1", version("v2")).await;
        let r2v2 = store.save_version("r2", version("v2")).await;

        store
            .record_build("p", BuildStatus::Succeeded, &[r1v1, r2v1], &[])
            .await;
        store
            .record_build("p", BuildStatus::Succeeded, &[r1v2, r2v2], &[])
            .await;

        assert_eq!(
            resolve(&store, &config, "downstream").await,
            Some(vec!["r1=v2".to_string(), "r2=v2".to_string()])
        );
    }

    #[tokio::test]
    async fn test_passed_inputs_never_mix_builds() {
        let config = two_resource_pipeline();
        let store = MemoryStore::new("main");
        let r1v1 = store.save_version("r1", version("v1")).await;
        let r2v1 = store.save_version("r2", version("v1")).await;
        let r1v2 = store.save_version("r1", version("v2")).await;
        let r2v2 = store.save_version("r2", version("v2")).await;

        // Newest of each resource never ran together.
        store
            .record_build("p", BuildStatus::Succeeded, &[r1v1, r2v2], &[])
            .await;
        store
            .record_build("p", BuildStatus::Succeeded, &[r1v2, r2v1], &[])
            .await;

        assert_eq!(
            resolve(&store, &config, "downstream").await,
            Some(vec!["r1=v2".to_string(), "r2=v1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_failed_upstream_builds_do_not_count() {
        let config = two_resource_pipeline();
        let store = MemoryStore::new("main");
        let r1 = store.save_version("r1", version("v1")).await;
        let r2 = store.save_version("r2", version("v1")).await;
        store
            .record_build("p", BuildStatus::Failed, &[r1, r2], &[])
            .await;

        assert_eq!(resolve(&store, &config, "downstream").await, None);
    }

    #[tokio::test]
    async fn test_outputs_count_as_used() {
        let config = parse_config(
            r#"
            resource "repo" type="git"
            resource "image" type="registry-image"

            job "package" {
                get "repo"
                put "image"
            }

            job "deploy" {
                get "image" passed="package"
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");
        let repo = store.save_version("repo", version("abc")).await;
        let image = store.save_version("image", version("sha1")).await;
        store
            .record_build("package", BuildStatus::Succeeded, &[repo], &[image])
            .await;

        assert_eq!(
            resolve(&store, &config, "deploy").await,
            Some(vec!["image=sha1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_every_passed_job_must_agree() {
        let config = parse_config(
            r#"
            resource "r1" type="git"
            resource "r2" type="git"

            job "a" {
                get "r1"
            }

            job "b" {
                get "r1"
                get "r2"
            }

            job "c" {
                get "r1" {
                    passed "a" "b"
                }
                get "r2" passed="b"
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");
        let r1v1 = store.save_version("r1", version("v1")).await;
        let r2v1 = store.save_version("r2", version("v1")).await;
        let r1v2 = store.save_version("r1", version("v2")).await;
        let r2v2 = store.save_version("r2", version("v2")).await;

        // "a" only ever passed v1, so "b"'s newer bundle is unusable.
        store
            .record_build("a", BuildStatus::Succeeded, &[r1v1.clone()], &[])
            .await;
        store
            .record_build("b", BuildStatus::Succeeded, &[r1v1, r2v1], &[])
            .await;
        store
            .record_build("b", BuildStatus::Succeeded, &[r1v2, r2v2], &[])
            .await;

        assert_eq!(
            resolve(&store, &config, "c").await,
            Some(vec!["r1=v1".to_string(), "r2=v1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_unshared_passed_inputs_resolve_independently() {
        let config = parse_config(
            r#"
            resource "r1" type="git"
            resource "r2" type="git"

            job "a" {
                get "r1"
            }

            job "b" {
                get "r2"
            }

            job "c" {
                get "r1" passed="a"
                get "r2" passed="b"
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");
        let r1v1 = store.save_version("r1", version("v1")).await;
        let r1v2 = store.save_version("r1", version("v2")).await;
        let r2v1 = store.save_version("r2", version("v1")).await;

        store
            .record_build("a", BuildStatus::Succeeded, &[r1v2], &[])
            .await;
        store
            .record_build("a", BuildStatus::Succeeded, &[r1v1], &[])
            .await;
        store
            .record_build("b", BuildStatus::Succeeded, &[r2v1], &[])
            .await;

        // Highest sequence wins, not the most recent build.
        assert_eq!(
            resolve(&store, &config, "c").await,
            Some(vec!["r1=v2".to_string(), "r2=v1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_undeclared_resource_is_an_error() {
        let config = parse_config(
            r#"
            resource "repo" type="git"
            job "unit" {
                get "repo"
            }
            "#,
        )
        .unwrap();
        let store = MemoryStore::new("main");
        let job = config.find_job("unit").unwrap();

        let err = resolver(&store).resolve(job, &[]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UndeclaredResource { .. }));
    }

    #[test]
    fn test_components_join_through_shared_jobs() {
        let input = |passed: &[&str]| InputConfig {
            resource: "r".to_string(),
            passed: passed.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        let inputs = vec![
            input(&["a"]),
            input(&[]),
            input(&["b"]),
            input(&["a", "b"]),
            input(&["c"]),
        ];

        assert_eq!(components(&inputs), vec![vec![0, 2, 3], vec![4]]);
    }
}
