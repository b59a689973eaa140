#![forbid(unsafe_code)]

//! Build-farm agent session and lease dispatch scheduler.
//!
//! Worker agents open a session, keep it alive with `UpdateSession` long
//! polls, and receive leases (units of work) from pluggable task sources.
//! Agent, session and lease state lives in `SQLite` ledgers updated with
//! compare-and-swap.

pub mod clock;
pub mod config;
pub mod downtime;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod scheduler;
pub mod task_source;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
