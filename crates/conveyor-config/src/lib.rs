//! KDL configuration parsing for Conveyor.
//!
//! This crate handles:
//! - Pipeline definitions (jobs, resources, resource types, groups)
//! - Pipeline validation, shared by the KDL parser and the config API
//! - Controller (system) configuration

pub mod error;
pub mod pipeline;
pub mod system;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_config;
pub use system::{SystemConfig, parse_system_config};
pub use validate::validate_config;
