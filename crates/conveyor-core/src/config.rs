//! Pipeline configuration: jobs, their inputs and outputs, and resources.

use serde::{Deserialize, Serialize};

/// Opaque parameters passed to a resource's get or put step.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Opaque resource source configuration.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// Resource types every controller understands without a declaration.
pub const BASE_RESOURCE_TYPES: &[&str] = &[
    "archive",
    "bosh-io-release",
    "bosh-io-stemcell",
    "docker-image",
    "git",
    "github-release",
    "hg",
    "pool",
    "registry-image",
    "s3",
    "semver",
    "time",
];

/// A complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Named groupings of jobs and resources, for presentation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupConfig>,
    /// Resources the jobs consume and produce.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Custom resource types declared by the pipeline.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
    /// Jobs in the pipeline.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Config {
    pub fn find_job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn find_resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Names of every job sharing at least one of `groups`.
    pub fn jobs_in_serial_groups(&self, groups: &[String]) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| j.serial_groups.iter().any(|g| groups.contains(g)))
            .map(|j| j.name.clone())
            .collect()
    }
}

/// A named group of jobs and resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

/// A resource definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
}

/// A custom resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
}

/// A job definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Whether the job's builds are visible without authentication.
    #[serde(default)]
    pub public: bool,
    /// At most one build of this job runs at a time.
    #[serde(default)]
    pub serial: bool,
    /// Jobs sharing a group run at most one build at a time across the group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serial_groups: Vec<String>,
    /// Explicit cap on concurrently running builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl JobConfig {
    /// Effective cap on running builds.
    ///
    /// Serial jobs and jobs in a serial group are always capped at one,
    /// whatever `max_in_flight` says. Otherwise an explicit `max_in_flight`
    /// applies, and without one the job is unbounded (`None`).
    pub fn max_in_flight(&self) -> Option<u32> {
        if self.is_serialized() {
            return Some(1);
        }
        self.max_in_flight.filter(|n| *n > 0)
    }

    pub fn is_serialized(&self) -> bool {
        self.serial || !self.serial_groups.is_empty()
    }

    /// Names of every resource the job gets or puts, in declaration order.
    pub fn resource_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        let declared = self
            .inputs
            .iter()
            .map(|i| i.resource.as_str())
            .chain(self.outputs.iter().map(|o| o.resource.as_str()));
        for name in declared {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn has_trigger_input(&self) -> bool {
        self.inputs.iter().any(|i| i.trigger)
    }
}

/// An input a job fetches before running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    pub resource: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Upstream jobs a version must have passed through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed: Vec<String>,
    /// Whether a new satisfying version creates a pending build.
    #[serde(default)]
    pub trigger: bool,
}

impl InputConfig {
    /// The input name, defaulting to the resource name.
    pub fn name(&self) -> &str {
        self.raw_name.as_deref().unwrap_or(&self.resource)
    }
}

/// Build outcome an output is pushed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCondition {
    Success,
    Failure,
}

/// An output a job pushes after running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub resource: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    #[serde(rename = "perform_on", default, skip_serializing_if = "Vec::is_empty")]
    pub raw_perform_on: Vec<OutputCondition>,
}

impl OutputConfig {
    /// Conditions the output is pushed on; success when none are given.
    pub fn perform_on(&self) -> Vec<OutputCondition> {
        if self.raw_perform_on.is_empty() {
            vec![OutputCondition::Success]
        } else {
            self.raw_perform_on.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(resource: &str) -> InputConfig {
        InputConfig {
            resource: resource.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_input_name_defaults_to_resource() {
        let mut i = input("repo");
        assert_eq!(i.name(), "repo");
        i.raw_name = Some("source-code".to_string());
        assert_eq!(i.name(), "source-code");
    }

    #[test]
    fn test_max_in_flight_defaults() {
        let mut job = JobConfig {
            name: "build".to_string(),
            ..Default::default()
        };
        assert_eq!(job.max_in_flight(), None);

        job.serial_groups = vec!["deploy".to_string()];
        assert_eq!(job.max_in_flight(), Some(1));

        job.max_in_flight = Some(3);
        assert_eq!(job.max_in_flight(), Some(1));

        job.serial_groups.clear();
        assert_eq!(job.max_in_flight(), Some(3));

        job.serial = true;
        assert_eq!(job.max_in_flight(), Some(1));

        job.max_in_flight = None;
        assert_eq!(job.max_in_flight(), Some(1));
    }

    #[test]
    fn test_perform_on_defaults_to_success() {
        let output = OutputConfig {
            resource: "image".to_string(),
            params: Params::new(),
            raw_perform_on: vec![],
        };
        assert_eq!(output.perform_on(), vec![OutputCondition::Success]);
    }

    #[test]
    fn test_config_json_shape() {
        let json = serde_json::json!({
            "resources": [{"name": "repo", "type": "git", "source": {"uri": "https://example.com/repo.git"}}],
            "jobs": [{
                "name": "unit",
                "serial": true,
                "inputs": [{"resource": "repo", "trigger": true, "passed": ["lint"]}],
                "outputs": [{"resource": "repo", "perform_on": ["success", "failure"]}]
            }]
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.resources[0].resource_type, "git");
        let job = config.find_job("unit").unwrap();
        assert!(job.serial);
        assert_eq!(job.inputs[0].passed, vec!["lint"]);
        assert_eq!(
            job.outputs[0].perform_on(),
            vec![OutputCondition::Success, OutputCondition::Failure]
        );

        let round_tripped: Config =
            serde_json::from_value(serde_json::to_value(&config).unwrap()).unwrap();
        assert_eq!(round_tripped, config);
    }

    #[test]
    fn test_jobs_in_serial_groups() {
        let config = Config {
            jobs: vec![
                JobConfig {
                    name: "deploy-staging".to_string(),
                    serial_groups: vec!["deploy".to_string()],
                    ..Default::default()
                },
                JobConfig {
                    name: "deploy-prod".to_string(),
                    serial_groups: vec!["deploy".to_string(), "prod".to_string()],
                    ..Default::default()
                },
                JobConfig {
                    name: "unit".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let members = config.jobs_in_serial_groups(&["deploy".to_string()]);
        assert_eq!(members, vec!["deploy-staging", "deploy-prod"]);
    }
}
