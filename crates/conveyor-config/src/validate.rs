//! Pipeline config validation.
//!
//! Runs on every config before it is saved, whether it arrived as KDL or as
//! JSON through the config API.

use crate::{ConfigError, ConfigResult};
use conveyor_core::{Config, JobConfig};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]*$").expect("valid regex"));

/// Check a config for broken references, duplicates and passed cycles.
pub fn validate_config(config: &Config) -> ConfigResult<()> {
    check_names("resource", config.resources.iter().map(|r| r.name.as_str()))?;
    check_names(
        "resource type",
        config.resource_types.iter().map(|t| t.name.as_str()),
    )?;
    check_names("job", config.jobs.iter().map(|j| j.name.as_str()))?;
    check_names("group", config.groups.iter().map(|g| g.name.as_str()))?;

    for resource in &config.resources {
        if resource.resource_type.is_empty() {
            return Err(ConfigError::MissingField(format!(
                "type for resource '{}'",
                resource.name
            )));
        }
    }

    for group in &config.groups {
        for job in &group.jobs {
            if config.find_job(job).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "group '{}' has unknown job '{}'",
                    group.name, job
                )));
            }
        }
        for resource in &group.resources {
            if config.find_resource(resource).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "group '{}' has unknown resource '{}'",
                    group.name, resource
                )));
            }
        }
    }

    for job in &config.jobs {
        validate_job(config, job)?;
    }

    if let Err(cycle) = detect_cycle(&config.jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(())
}

fn validate_job(config: &Config, job: &JobConfig) -> ConfigResult<()> {
    if job.max_in_flight == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: format!("max_in_flight for job '{}'", job.name),
            message: "must be at least 1".to_string(),
        });
    }

    for group in &job.serial_groups {
        if group.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("serial_groups for job '{}'", job.name),
                message: "group names must not be empty".to_string(),
            });
        }
    }

    let mut input_names = HashSet::new();
    for input in &job.inputs {
        if !input_names.insert(input.name()) {
            return Err(ConfigError::Duplicate(format!(
                "input '{}' in job '{}'",
                input.name(),
                job.name
            )));
        }

        if config.find_resource(&input.resource).is_none() {
            return Err(ConfigError::InvalidReference(format!(
                "job '{}' input '{}' has unknown resource '{}'",
                job.name,
                input.name(),
                input.resource
            )));
        }

        for passed in &input.passed {
            if passed == &job.name {
                return Err(ConfigError::CycleDetected(format!(
                    "{} -> {}",
                    job.name, passed
                )));
            }

            let upstream = config.find_job(passed).ok_or_else(|| {
                ConfigError::InvalidReference(format!(
                    "job '{}' input '{}' is constrained by unknown job '{}'",
                    job.name,
                    input.name(),
                    passed
                ))
            })?;

            if !upstream.resource_names().contains(&input.resource.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' input '{}' is constrained by job '{}', which does not use resource '{}'",
                    job.name,
                    input.name(),
                    passed,
                    input.resource
                )));
            }
        }
    }

    for output in &job.outputs {
        if config.find_resource(&output.resource).is_none() {
            return Err(ConfigError::InvalidReference(format!(
                "job '{}' output has unknown resource '{}'",
                job.name, output.resource
            )));
        }
    }

    Ok(())
}

fn check_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !NAME_REGEX.is_match(name) {
            return Err(ConfigError::InvalidValue {
                field: format!("{} name", kind),
                message: format!("'{}' is not a valid name", name),
            });
        }
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("{} '{}'", kind, name)));
        }
    }
    Ok(())
}

/// Detect cycles in the passed graph using DFS.
fn detect_cycle(jobs: &[JobConfig]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let upstream: HashMap<&str, Vec<&str>> = jobs
        .iter()
        .map(|j| {
            let passed = j
                .inputs
                .iter()
                .flat_map(|i| i.passed.iter().map(String::as_str))
                .collect();
            (j.name.as_str(), passed)
        })
        .collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&job.name, &upstream, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    upstream: &'a HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(deps) = upstream.get(node) {
        for &dep in deps {
            if !visited.contains_key(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, upstream, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
