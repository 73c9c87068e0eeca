//! Commonly used types.

pub use crate::build::{BuildMetadata, BuildStatus};
pub use crate::db::{
    Build, BuildStore, Checkable, CheckableKind, Lock, LockFactory, LockId, ResourceCacheFactory,
    ResourceCatalog, ResourceConfigFactory, ResourceConfigScope, StoreError, StoreResult,
};
pub use crate::duration::{format_duration, parse_duration};
pub use crate::pipeline::PipelineConfig;
pub use crate::plan::{Plan, PlanFactory, PlanId, PlanKind};
pub use crate::planner::Planner;
pub use crate::resource::{
    BuildInput, NamedResources, Params, Resource, ResourceType, Source, Version, VersionResult,
    VersionedResourceType, VersionedResourceTypes,
};
pub use crate::step_config::StepConfig;
pub use crate::task::TaskConfig;
