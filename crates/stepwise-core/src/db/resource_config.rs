use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::{Lock, StoreResult};
use crate::resource::{MetadataField, Source, Version, VersionedResourceTypes};

/// A resolved `(type, source)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Store ID
    pub id: u64,
    /// Resource type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Source with credentials already resolved
    pub source: Source,
}

/// A pipeline resource owning a non-shared scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Pipeline the resource belongs to
    pub pipeline_id: u64,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    /// Creates a key
    pub fn new(pipeline_id: u64, name: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            name: name.into(),
        }
    }
}

/// One saved version of a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfigVersion {
    /// Store ID
    pub id: u64,
    /// The version
    pub version: Version,
    /// Metadata reported by the latest get or put of this version
    pub metadata: Vec<MetadataField>,
    /// Position in check order; higher is newer
    pub check_order: u64,
}

/// The unit of check serialization: a config plus an optional owning resource
#[async_trait]
pub trait ResourceConfigScope: Send + Sync + fmt::Debug {
    /// Store ID
    fn id(&self) -> u64;

    /// The config this scope belongs to
    fn resource_config(&self) -> &ResourceConfig;

    /// The newest version by check order
    async fn latest_version(&self) -> StoreResult<Option<ResourceConfigVersion>>;

    /// Every version, oldest first
    async fn versions(&self) -> StoreResult<Vec<ResourceConfigVersion>>;

    /// Saves versions ordered oldest to latest; known versions move to the end
    async fn save_versions(&self, versions: &[Version]) -> StoreResult<()>;

    /// Updates the metadata of a known version, returning whether it was found
    async fn update_metadata(&self, version: &Version, metadata: &[MetadataField]) -> StoreResult<bool>;

    /// Records the outcome of the last check
    async fn set_check_error(&self, error: Option<String>) -> StoreResult<()>;

    /// The error of the last check, if it failed
    async fn check_error(&self) -> StoreResult<Option<String>>;

    /// Tries to take the lock serializing checks of this scope
    async fn acquire_checking_lock(&self) -> StoreResult<Option<Box<dyn Lock>>>;

    /// Marks the start of a check
    async fn update_last_check_start_time(&self) -> StoreResult<()>;

    /// Marks the end of a check
    async fn update_last_check_end_time(&self) -> StoreResult<()>;

    /// When the last check started
    async fn last_check_start_time(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// When the last check ended
    async fn last_check_end_time(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Finds or creates configs and scopes
#[async_trait]
pub trait ResourceConfigFactory: Send + Sync {
    /// Resolves the config for a type and evaluated source
    async fn find_or_create_resource_config(
        &self,
        type_name: &str,
        source: &Source,
        resource_types: &VersionedResourceTypes,
    ) -> StoreResult<ResourceConfig>;

    /// Resolves the scope of a config, shared when `resource` is `None`
    async fn find_or_create_scope(
        &self,
        config: &ResourceConfig,
        resource: Option<&ResourceKey>,
    ) -> StoreResult<Arc<dyn ResourceConfigScope>>;

    /// Looks up a scope by ID
    async fn find_scope(&self, id: u64) -> StoreResult<Option<Arc<dyn ResourceConfigScope>>>;

    /// How many resources and resource types are checked periodically
    async fn checkable_count(&self) -> StoreResult<usize>;
}
