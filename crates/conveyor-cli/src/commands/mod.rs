//! CLI command implementations.

pub mod builds;
pub mod config;

use anyhow::{Context, Result};
use conveyor_core::Config;

/// Read and validate a KDL pipeline config from disk.
pub fn load_config(path: &str) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    conveyor_config::parse_config(&content).with_context(|| format!("invalid config in {}", path))
}

pub fn validate(path: &str) -> Result<()> {
    let config = load_config(path)?;
    println!(
        "Configuration is valid: {} resources, {} jobs",
        config.resources.len(),
        config.jobs.len()
    );
    Ok(())
}
