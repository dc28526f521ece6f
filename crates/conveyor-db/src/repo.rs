//! PostgreSQL implementations of the store traits.

pub mod config;
pub mod lease;
pub mod version;

pub use config::{PgConfigRepo, PipelineRecord};
pub use lease::PgLease;
pub use version::{PgPipelineStores, PgVersionStore};
