//! # mutcov
//!
//! `mutcov` is the orchestration core of a mutation-based coverage tool
//! for hardware designs:
//! - `store`: persistent SQLite work queue and result cache
//! - `engine`: deterministic per-mutation decision replay
//! - `scheduler`: concurrent batch dispatch of external test runners
//! - `project`: initialization, generator invocation, population top-up
//!
//! The expensive work (generating mutations, actually running tests)
//! happens in external processes; this crate decides what to run,
//! records what happened, and can rebuild all of its derived state from
//! the cached results at any time.

#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod project;
pub mod report;
pub mod rng;
pub mod scheduler;
pub mod script;
pub mod store;
pub mod task;

pub use config::{Config, ConfigError, TestConfig};
pub use engine::EngineError;
pub use project::ProjectError;
pub use report::ReportError;
pub use scheduler::{RunOptions, SchedulerError};
pub use script::ScriptError;
pub use store::{Store, StoreError};
