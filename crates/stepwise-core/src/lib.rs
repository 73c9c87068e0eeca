//! # Stepwise Core
//!
//! Domain types shared by the Stepwise engine and scheduler.
//!
//! ## Architecture
//!
//! - `step_config`: the declarative step tree users write
//! - `plan`: the compiled plan tree and its JSON encoding
//! - `planner`: compiles step configuration into plans
//! - `resource`: resources, resource types, versions and image plans
//! - `task`: task configuration and validation
//! - `pipeline`: whole-pipeline configuration
//! - `build`: build status and metadata
//! - `duration`: Go-style duration strings
//! - `db`: store contracts and in-memory implementations
//!
//! ## Example
//!
//! ```rust
//! use stepwise_core::planner::Planner;
//! use stepwise_core::resource::{BuildInput, NamedResources, Resource, Version, VersionedResourceTypes};
//! use stepwise_core::step_config::{GetStepConfig, StepConfig};
//!
//! let resources = NamedResources(vec![Resource::new("repo", "git")]);
//! let inputs = vec![BuildInput::new("repo", Version::from([("ref".into(), "abc".into())]))];
//! let config = StepConfig::Get(GetStepConfig {
//!     name: "repo".into(),
//!     ..GetStepConfig::default()
//! });
//!
//! let plan = Planner::new(0)
//!     .create(&config, &resources, &VersionedResourceTypes::default(), &inputs)
//!     .unwrap();
//! assert_eq!(plan.kind_name(), "get");
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod build;
pub mod db;
pub mod duration;
pub mod pipeline;
pub mod plan;
pub mod planner;
pub mod prelude;
pub mod resource;
pub mod step_config;
pub mod task;

pub use build::{BuildMetadata, BuildStatus};
pub use duration::{DurationError, format_duration, parse_duration};
pub use plan::{Plan, PlanFactory, PlanId, PlanKind};
pub use planner::{Planner, PlannerError};
pub use step_config::StepConfig;
