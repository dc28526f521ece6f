//! Builds and their resolved inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Params;
use crate::{BuildId, ResourceVersion};

/// Status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown build status: {}",
                other
            ))),
        }
    }
}

/// One input version chosen for a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    /// Input name within the job.
    pub name: String,
    pub resource: String,
    pub version: ResourceVersion,
    #[serde(default)]
    pub params: Params,
}

/// Input versions chosen for a build, in the job's input order.
pub type ResolvedInputs = Vec<ResolvedInput>;

/// A build of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub job_name: String,
    /// Per-job ordinal (1, 2, 3, ...).
    pub number: i64,
    pub status: BuildStatus,
    /// Set once the scheduler has picked the build and attached inputs.
    pub is_scheduled: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Empty until the build is started.
    #[serde(default)]
    pub inputs: ResolvedInputs,
}

impl Build {
    /// The resolved input with the given name, if any.
    pub fn input(&self, name: &str) -> Option<&ResolvedInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}
