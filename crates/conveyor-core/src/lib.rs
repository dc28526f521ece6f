//! Core domain types and traits for the Conveyor CI controller.
//!
//! This crate contains:
//! - Pipeline configuration types (jobs, inputs, resources)
//! - Resource versions and builds
//! - Identifiers shared across crates
//! - Store capability traits consumed by the scheduler

pub mod build;
pub mod config;
pub mod error;
pub mod id;
pub mod store;
pub mod version;

pub use build::{Build, BuildStatus, ResolvedInput, ResolvedInputs};
pub use config::{
    Config, GroupConfig, InputConfig, JobConfig, OutputCondition, OutputConfig, Params,
    ResourceConfig, ResourceType, Source,
};
pub use error::{Error, Result};
pub use id::{BuildId, ConfigVersion};
pub use store::{ConfigStore, Lease, PipelineStores, VersionStore};
pub use version::{BuildVersions, ResourceVersion, Version};
