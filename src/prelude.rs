//! Prelude module for common imports

pub use crate::infrastructure::{Config, ConfigError, LogFormat, init_logging};
pub use crate::orchestrator::{Orchestrator, Stores};

// Plans and configuration
pub use stepwise_core::build::{BuildMetadata, BuildStatus};
pub use stepwise_core::db::{Build, BuildStore, Checkable, CheckableKind, ResourceCatalog};
pub use stepwise_core::pipeline::PipelineConfig;
pub use stepwise_core::plan::{Plan, PlanFactory, PlanId, PlanKind};
pub use stepwise_core::planner::Planner;
pub use stepwise_core::step_config::StepConfig;

// Events
pub use stepwise_events::{BuildEvent, BuildEventStore, NotificationBus};

// Execution
pub use stepwise_executor::{
    ArtifactRepository, Engine, ExecResult, RunState, Secrets, StaticSecrets, Step, StepContext, WorkerClient,
};

// Scheduling
pub use stepwise_scheduler::{Checker, Scanner};
