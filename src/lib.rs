//! # Stepwise - a CI/CD build orchestrator
//!
//! Stepwise compiles pipeline configuration into plans, runs plans as
//! trees of steps against a pluggable worker, and keeps resources checked
//! for new versions.
//!
//! The workspace is split by concern:
//!
//! - [`stepwise_core`]: plans, the planner, pipeline configuration and the store contracts
//! - [`stepwise_events`]: build events and in-process notifications
//! - [`stepwise_executor`]: steps, the artifact repository, delegates and the engine
//! - [`stepwise_scheduler`]: the scanner and checker loops
//!
//! This crate ties them together behind an [`Orchestrator`] configured by
//! a YAML [`Config`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod infrastructure;
pub mod orchestrator;

// Prelude module for common imports
pub mod prelude;

pub use infrastructure::{Config, ConfigError, LogFormat, init_logging};
pub use orchestrator::{Orchestrator, Stores};

pub use stepwise_core;
pub use stepwise_events;
pub use stepwise_executor;
pub use stepwise_scheduler;
