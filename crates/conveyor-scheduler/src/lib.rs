//! Scheduling for Conveyor.
//!
//! Every tick re-reads the store and decides which pending builds may start
//! and with which input versions. Nothing is remembered between ticks, so any
//! number of controllers can tick the same pipeline and any of them can be
//! killed at any point.

pub mod driver;
pub mod error;
pub mod resolver;
pub mod starter;
pub mod trigger;

pub use driver::TickDriver;
pub use error::{Failure, SchedulerError, SchedulerResult};
pub use resolver::Resolver;
pub use starter::BuildStarter;
pub use trigger::BuildTrigger;
