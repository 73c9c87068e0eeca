use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db::{ResourceCache, ResourceCacheFactory, ResourceCacheUser, StoreError, StoreResult};
use crate::resource::{Params, Source, Version, VersionedResourceTypes};

/// Resource caches keyed by their canonical JSON identity
#[derive(Debug, Default)]
pub struct InMemoryResourceCacheFactory {
    caches: DashMap<String, ResourceCache>,
    users: DashMap<u64, Vec<ResourceCacheUser>>,
    next_id: AtomicU64,
}

impl InMemoryResourceCacheFactory {
    /// Creates an empty factory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Users recorded for a cache
    #[must_use]
    pub fn users(&self, cache_id: u64) -> Vec<ResourceCacheUser> {
        self.users
            .get(&cache_id)
            .map(|users| users.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResourceCacheFactory for InMemoryResourceCacheFactory {
    async fn find_or_create_resource_cache(
        &self,
        user: ResourceCacheUser,
        type_name: &str,
        version: &Version,
        source: &Source,
        params: &Params,
        resource_types: &VersionedResourceTypes,
    ) -> StoreResult<ResourceCache> {
        let key = serde_json::to_string(&(type_name, version, source, params, resource_types))
            .map_err(|err| StoreError::Unavailable {
                reason: format!("encoding resource cache key: {err}"),
            })?;

        let cache = match self.caches.entry(key) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot
                .insert(ResourceCache {
                    id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                    type_name: type_name.to_string(),
                    version: version.clone(),
                    source: source.clone(),
                    params: params.clone(),
                })
                .clone(),
        };

        let mut users = self.users.entry(cache.id).or_default();
        if !users.contains(&user) {
            users.push(user);
        }
        Ok(cache)
    }
}
