use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::InMemoryLockFactory;
use crate::db::{
    Lock, LockFactory, LockId, ResourceConfig, ResourceConfigFactory, ResourceConfigScope,
    ResourceConfigVersion, ResourceKey, StoreResult,
};
use crate::resource::{MetadataField, Source, Version, VersionedResourceTypes};

/// Configs and scopes kept in memory
#[derive(Debug, Default)]
pub struct InMemoryResourceConfigFactory {
    locks: InMemoryLockFactory,
    configs: Mutex<Vec<ResourceConfig>>,
    scopes: DashMap<u64, Arc<InMemoryScope>>,
    scope_index: DashMap<(u64, Option<ResourceKey>), u64>,
    next_id: AtomicU64,
    checkable_count: AtomicUsize,
}

impl InMemoryResourceConfigFactory {
    /// Creates an empty factory whose scopes lock through `locks`
    #[must_use]
    pub fn new(locks: InMemoryLockFactory) -> Self {
        Self {
            locks,
            ..Self::default()
        }
    }

    /// Concrete scope by ID, for callers that need more than the trait
    #[must_use]
    pub fn scope(&self, id: u64) -> Option<Arc<InMemoryScope>> {
        self.scopes.get(&id).map(|scope| Arc::clone(scope.value()))
    }

    /// Sets the number reported by `checkable_count`
    pub fn set_checkable_count(&self, count: usize) {
        self.checkable_count.store(count, Ordering::SeqCst);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ResourceConfigFactory for InMemoryResourceConfigFactory {
    async fn find_or_create_resource_config(
        &self,
        type_name: &str,
        source: &Source,
        _resource_types: &VersionedResourceTypes,
    ) -> StoreResult<ResourceConfig> {
        let mut configs = self.configs.lock();
        if let Some(existing) = configs
            .iter()
            .find(|config| config.type_name == type_name && &config.source == source)
        {
            return Ok(existing.clone());
        }

        let config = ResourceConfig {
            id: self.next_id(),
            type_name: type_name.to_string(),
            source: source.clone(),
        };
        configs.push(config.clone());
        Ok(config)
    }

    async fn find_or_create_scope(
        &self,
        config: &ResourceConfig,
        resource: Option<&ResourceKey>,
    ) -> StoreResult<Arc<dyn ResourceConfigScope>> {
        let key = (config.id, resource.cloned());
        let id = *self.scope_index.entry(key).or_insert_with(|| {
            let id = self.next_id();
            self.scopes.insert(
                id,
                Arc::new(InMemoryScope::new(id, config.clone(), self.locks.clone())),
            );
            id
        });

        self.scope(id)
            .map(|scope| scope as Arc<dyn ResourceConfigScope>)
            .ok_or_else(|| crate::db::StoreError::not_found(format!("resource config scope {id}")))
    }

    async fn find_scope(&self, id: u64) -> StoreResult<Option<Arc<dyn ResourceConfigScope>>> {
        Ok(self
            .scope(id)
            .map(|scope| scope as Arc<dyn ResourceConfigScope>))
    }

    async fn checkable_count(&self) -> StoreResult<usize> {
        Ok(self.checkable_count.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    versions: Vec<ResourceConfigVersion>,
    next_order: u64,
    next_version_id: u64,
    check_error: Option<String>,
    last_check_start: Option<DateTime<Utc>>,
    last_check_end: Option<DateTime<Utc>>,
}

/// A scope kept in memory
#[derive(Debug)]
pub struct InMemoryScope {
    id: u64,
    config: ResourceConfig,
    locks: InMemoryLockFactory,
    state: Mutex<ScopeState>,
}

impl InMemoryScope {
    fn new(id: u64, config: ResourceConfig, locks: InMemoryLockFactory) -> Self {
        Self {
            id,
            config,
            locks,
            state: Mutex::new(ScopeState::default()),
        }
    }

    /// Overrides the last check end time
    pub fn set_last_check_end_time(&self, at: Option<DateTime<Utc>>) {
        self.state.lock().last_check_end = at;
    }
}

#[async_trait]
impl ResourceConfigScope for InMemoryScope {
    fn id(&self) -> u64 {
        self.id
    }

    fn resource_config(&self) -> &ResourceConfig {
        &self.config
    }

    async fn latest_version(&self) -> StoreResult<Option<ResourceConfigVersion>> {
        Ok(self.state.lock().versions.last().cloned())
    }

    async fn versions(&self) -> StoreResult<Vec<ResourceConfigVersion>> {
        Ok(self.state.lock().versions.clone())
    }

    async fn save_versions(&self, versions: &[Version]) -> StoreResult<()> {
        let mut state = self.state.lock();
        for version in versions {
            state.next_order += 1;
            let check_order = state.next_order;

            let saved = match state.versions.iter().position(|saved| &saved.version == version) {
                Some(index) => {
                    let mut saved = state.versions.remove(index);
                    saved.check_order = check_order;
                    saved
                }
                None => {
                    state.next_version_id += 1;
                    ResourceConfigVersion {
                        id: state.next_version_id,
                        version: version.clone(),
                        metadata: Vec::new(),
                        check_order,
                    }
                }
            };
            state.versions.push(saved);
        }
        Ok(())
    }

    async fn update_metadata(&self, version: &Version, metadata: &[MetadataField]) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.versions.iter_mut().find(|saved| &saved.version == version) {
            Some(saved) => {
                saved.metadata = metadata.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_check_error(&self, error: Option<String>) -> StoreResult<()> {
        self.state.lock().check_error = error;
        Ok(())
    }

    async fn check_error(&self) -> StoreResult<Option<String>> {
        Ok(self.state.lock().check_error.clone())
    }

    async fn acquire_checking_lock(&self) -> StoreResult<Option<Box<dyn Lock>>> {
        self.locks
            .acquire(LockId::ResourceConfigChecking(self.id))
            .await
    }

    async fn update_last_check_start_time(&self) -> StoreResult<()> {
        self.state.lock().last_check_start = Some(Utc::now());
        Ok(())
    }

    async fn update_last_check_end_time(&self) -> StoreResult<()> {
        self.state.lock().last_check_end = Some(Utc::now());
        Ok(())
    }

    async fn last_check_start_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().last_check_start)
    }

    async fn last_check_end_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().last_check_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn version(v: &str) -> Version {
        Version::from([("ref".to_string(), v.to_string())])
    }

    fn source(uri: &str) -> Source {
        Source::from_iter([("uri".to_string(), json!(uri))])
    }

    #[tokio::test]
    async fn configs_and_scopes_are_reused() {
        let factory = InMemoryResourceConfigFactory::new(InMemoryLockFactory::new());
        let types = VersionedResourceTypes::default();

        let a = factory
            .find_or_create_resource_config("git", &source("a"), &types)
            .await
            .expect("config");
        let again = factory
            .find_or_create_resource_config("git", &source("a"), &types)
            .await
            .expect("config");
        let b = factory
            .find_or_create_resource_config("git", &source("b"), &types)
            .await
            .expect("config");
        assert_eq!(a, again);
        assert_ne!(a.id, b.id);

        let key = ResourceKey::new(1, "repo");
        let shared = factory.find_or_create_scope(&a, None).await.expect("scope");
        let owned = factory.find_or_create_scope(&a, Some(&key)).await.expect("scope");
        let owned_again = factory.find_or_create_scope(&a, Some(&key)).await.expect("scope");
        assert_ne!(shared.id(), owned.id());
        assert_eq!(owned.id(), owned_again.id());
    }

    #[tokio::test]
    async fn saving_a_known_version_makes_it_latest_again() {
        let factory = InMemoryResourceConfigFactory::new(InMemoryLockFactory::new());
        let config = factory
            .find_or_create_resource_config("git", &source("a"), &VersionedResourceTypes::default())
            .await
            .expect("config");
        let scope = factory.find_or_create_scope(&config, None).await.expect("scope");

        scope
            .save_versions(&[version("1"), version("2"), version("3")])
            .await
            .expect("saved");
        scope.save_versions(&[version("2")]).await.expect("saved");

        let ordered: Vec<Version> = scope
            .versions()
            .await
            .expect("versions")
            .into_iter()
            .map(|saved| saved.version)
            .collect();
        assert_eq!(ordered, vec![version("1"), version("3"), version("2")]);
        assert_eq!(
            scope.latest_version().await.expect("latest").map(|v| v.version),
            Some(version("2"))
        );
    }

    #[tokio::test]
    async fn checking_lock_is_exclusive_per_scope() {
        let factory = InMemoryResourceConfigFactory::new(InMemoryLockFactory::new());
        let config = factory
            .find_or_create_resource_config("git", &source("a"), &VersionedResourceTypes::default())
            .await
            .expect("config");
        let scope = factory.find_or_create_scope(&config, None).await.expect("scope");

        let held = scope.acquire_checking_lock().await.expect("store ok");
        assert!(held.is_some());
        assert!(scope.acquire_checking_lock().await.expect("store ok").is_none());
    }
}
