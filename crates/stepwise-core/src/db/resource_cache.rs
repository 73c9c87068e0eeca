use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StoreResult;
use crate::resource::{Params, Source, Version, VersionedResourceTypes};

/// Who keeps a resource cache alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceCacheUser {
    /// A build fetching the cache
    Build(u64),
}

/// A fetched resource version, identified by everything that affects its content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCache {
    /// Store ID
    pub id: u64,
    /// Resource type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Fetched version
    pub version: Version,
    /// Source the version was fetched from
    pub source: Source,
    /// Fetch params
    pub params: Params,
}

/// Finds or creates resource caches
#[async_trait]
pub trait ResourceCacheFactory: Send + Sync {
    /// Resolves the cache keyed by `(type, version, source, params, resource types)`
    async fn find_or_create_resource_cache(
        &self,
        user: ResourceCacheUser,
        type_name: &str,
        version: &Version,
        source: &Source,
        params: &Params,
        resource_types: &VersionedResourceTypes,
    ) -> StoreResult<ResourceCache>;
}
