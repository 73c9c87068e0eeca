use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::StoreResult;
use crate::pipeline::PipelineConfig;
use crate::resource::{NamedResources, Source, Version, VersionResult, VersionedResourceTypes};

/// Whether a checkable is a resource or a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckableKind {
    /// A pipeline resource
    Resource,
    /// A custom resource type
    ResourceType,
}

impl fmt::Display for CheckableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource => f.write_str("resource"),
            Self::ResourceType => f.write_str("resource type"),
        }
    }
}

/// A resource or resource type that can be polled for new versions
#[async_trait]
pub trait Checkable: Send + Sync + fmt::Debug {
    /// Resource or resource type
    fn kind(&self) -> CheckableKind;

    /// Name within the pipeline
    fn name(&self) -> &str;

    /// Owning pipeline ID
    fn pipeline_id(&self) -> u64;

    /// Owning pipeline name
    fn pipeline_name(&self) -> &str;

    /// Owning team ID
    fn team_id(&self) -> u64;

    /// Owning team name
    fn team_name(&self) -> &str;

    /// Type name
    fn type_name(&self) -> &str;

    /// Source, possibly containing `((var))` references
    fn source(&self) -> &Source;

    /// Worker tags
    fn tags(&self) -> &[String];

    /// Explicit check interval
    fn check_every(&self) -> Option<&str>;

    /// Explicit check timeout
    fn check_timeout(&self) -> Option<&str>;

    /// Whether new versions are announced through a webhook
    fn has_webhook(&self) -> bool;

    /// Version pinned by configuration or by an operator
    async fn current_pinned_version(&self) -> StoreResult<Option<Version>>;

    /// Scope the checkable currently points at
    async fn resource_config_scope_id(&self) -> StoreResult<Option<u64>>;

    /// When the current scope's last check ended
    async fn last_check_end_time(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// Points the checkable at a scope
    async fn set_resource_config_scope(&self, scope_id: u64) -> StoreResult<()>;

    /// Records a failure to set up a check, or clears it
    async fn set_check_setup_error(&self, error: Option<String>) -> StoreResult<()>;

    /// The last recorded setup error
    async fn check_setup_error(&self) -> StoreResult<Option<String>>;
}

/// Pipelines and their resources
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    /// Every resource of every active pipeline
    async fn resources(&self) -> StoreResult<Vec<Arc<dyn Checkable>>>;

    /// Every resource type of every active pipeline
    async fn resource_types(&self) -> StoreResult<Vec<Arc<dyn Checkable>>>;

    /// Finds one checkable
    async fn find_checkable(
        &self,
        pipeline_id: u64,
        kind: CheckableKind,
        name: &str,
    ) -> StoreResult<Option<Arc<dyn Checkable>>>;

    /// A pipeline's resources
    async fn named_resources(&self, pipeline_id: u64) -> StoreResult<NamedResources>;

    /// A pipeline's resource types with their latest versions
    async fn versioned_resource_types(&self, pipeline_id: u64) -> StoreResult<VersionedResourceTypes>;

    /// Records metadata observed by a get of a resource's version
    async fn save_resource_version(
        &self,
        pipeline_id: u64,
        resource: &str,
        result: &VersionResult,
    ) -> StoreResult<()>;

    /// Records a version produced by a put
    async fn save_output(
        &self,
        pipeline_id: u64,
        resource: &str,
        source: &Source,
        resource_types: &VersionedResourceTypes,
        result: &VersionResult,
    ) -> StoreResult<()>;

    /// Creates or updates a pipeline, returning whether anything changed
    async fn save_pipeline(&self, team: &str, name: &str, config: &PipelineConfig) -> StoreResult<bool>;

    /// Loads a pipeline's configuration
    async fn pipeline(&self, team: &str, name: &str) -> StoreResult<Option<PipelineConfig>>;
}
