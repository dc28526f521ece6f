//! API server for Conveyor.
//!
//! Serves pipeline configs with optimistic versioning and lets clients queue
//! builds by hand. Scheduling itself runs in the background tick driver.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
