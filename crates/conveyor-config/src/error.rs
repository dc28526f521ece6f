//! Errors raised while reading or validating pipeline and system configs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// A node lacks a name or a required property.
    #[error("missing {0}")]
    MissingField(String),

    #[error("{field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{0} is declared more than once")]
    Duplicate(String),

    /// A name that points at a job, resource or group that does not exist.
    #[error("{0}")]
    InvalidReference(String),

    /// `passed` constraints that loop back on themselves.
    #[error("passed constraints form a cycle: {0}")]
    CycleDetected(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
