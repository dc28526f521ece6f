//! Scheduler errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job '{job}' input '{input}' references undeclared resource '{resource}'")]
    UndeclaredResource {
        job: String,
        input: String,
        resource: String,
    },

    #[error("job '{job}' puts to undeclared resource '{resource}'")]
    UndeclaredOutput { job: String, resource: String },

    #[error("resource '{resource}' used by job '{job}' has undeclared type '{resource_type}'")]
    UndeclaredResourceType {
        job: String,
        resource: String,
        resource_type: String,
    },

    #[error(transparent)]
    Store(#[from] conveyor_core::Error),

    #[error("tick task did not finish: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("jobs failed: {}", list(.0))]
    JobsFailed(Vec<Failure>),

    #[error("pipelines failed: {}", list(.0))]
    PipelinesFailed(Vec<Failure>),
}

/// A job or pipeline that failed within a tick, and why.
#[derive(Debug)]
pub struct Failure {
    pub name: String,
    pub error: SchedulerError,
}

impl Failure {
    pub fn new(name: impl Into<String>, error: SchedulerError) -> Self {
        Self {
            name: name.into(),
            error,
        }
    }
}

fn list(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.name, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
