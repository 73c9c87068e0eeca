use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::InMemoryResourceConfigFactory;
use crate::db::{
    Checkable, CheckableKind, ResourceCatalog, ResourceConfigFactory, ResourceConfigScope,
    ResourceKey, StoreError, StoreResult,
};
use crate::pipeline::PipelineConfig;
use crate::resource::{
    NamedResources, Resource, ResourceType, Source, Version, VersionResult,
    VersionedResourceType, VersionedResourceTypes,
};

#[derive(Debug, Default)]
struct CheckableState {
    scope_id: Option<u64>,
    setup_error: Option<String>,
    pinned: Option<Version>,
}

/// A resource or resource type of an in-memory pipeline
#[derive(Debug)]
pub struct InMemoryCheckable {
    kind: CheckableKind,
    name: String,
    pipeline_id: u64,
    pipeline_name: String,
    team_id: u64,
    team_name: String,
    type_name: String,
    source: Source,
    tags: Vec<String>,
    check_every: Option<String>,
    check_timeout: Option<String>,
    has_webhook: bool,
    configured_version: Option<Version>,
    configs: Arc<InMemoryResourceConfigFactory>,
    state: Mutex<CheckableState>,
}

impl InMemoryCheckable {
    /// Pins a version, or unpins with `None`
    pub fn pin(&self, version: Option<Version>) {
        self.state.lock().pinned = version;
    }

    fn scope(&self) -> Option<Arc<super::InMemoryScope>> {
        let scope_id = self.state.lock().scope_id?;
        self.configs.scope(scope_id)
    }

    fn declared_as(&self, kind: CheckableKind, name: &str, type_name: &str, source: &Source) -> bool {
        self.kind == kind && self.name == name && self.type_name == type_name && &self.source == source
    }
}

#[async_trait]
impl Checkable for InMemoryCheckable {
    fn kind(&self) -> CheckableKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn pipeline_id(&self) -> u64 {
        self.pipeline_id
    }

    fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    fn team_id(&self) -> u64 {
        self.team_id
    }

    fn team_name(&self) -> &str {
        &self.team_name
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn source(&self) -> &Source {
        &self.source
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn check_every(&self) -> Option<&str> {
        self.check_every.as_deref()
    }

    fn check_timeout(&self) -> Option<&str> {
        self.check_timeout.as_deref()
    }

    fn has_webhook(&self) -> bool {
        self.has_webhook
    }

    async fn current_pinned_version(&self) -> StoreResult<Option<Version>> {
        let pinned = self.state.lock().pinned.clone();
        Ok(pinned.or_else(|| self.configured_version.clone()))
    }

    async fn resource_config_scope_id(&self) -> StoreResult<Option<u64>> {
        Ok(self.state.lock().scope_id)
    }

    async fn last_check_end_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        match self.scope() {
            Some(scope) => scope.last_check_end_time().await,
            None => Ok(None),
        }
    }

    async fn set_resource_config_scope(&self, scope_id: u64) -> StoreResult<()> {
        self.state.lock().scope_id = Some(scope_id);
        Ok(())
    }

    async fn set_check_setup_error(&self, error: Option<String>) -> StoreResult<()> {
        self.state.lock().setup_error = error;
        Ok(())
    }

    async fn check_setup_error(&self) -> StoreResult<Option<String>> {
        Ok(self.state.lock().setup_error.clone())
    }
}

#[derive(Debug)]
struct PipelineRecord {
    id: u64,
    name: String,
    team_id: u64,
    team_name: String,
    config: PipelineConfig,
    resources: Vec<Arc<InMemoryCheckable>>,
    resource_types: Vec<Arc<InMemoryCheckable>>,
}

/// Pipelines kept in memory
#[derive(Debug)]
pub struct InMemoryCatalog {
    configs: Arc<InMemoryResourceConfigFactory>,
    pipelines: RwLock<Vec<PipelineRecord>>,
    teams: DashMap<String, u64>,
    next_id: AtomicU64,
}

impl InMemoryCatalog {
    /// Creates an empty catalog whose checkables resolve scopes through `configs`
    #[must_use]
    pub fn new(configs: Arc<InMemoryResourceConfigFactory>) -> Self {
        Self {
            configs,
            pipelines: RwLock::new(Vec::new()),
            teams: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Creates or replaces a pipeline, returning its ID
    pub fn add_pipeline(&self, team: &str, name: &str, config: PipelineConfig) -> u64 {
        let next_team_id = self.teams.len() as u64 + 1;
        let team_id = *self.teams.entry(team.to_string()).or_insert(next_team_id);

        let mut pipelines = self.pipelines.write();
        let id = match pipelines
            .iter()
            .position(|p| p.team_name == team && p.name == name)
        {
            Some(index) => {
                let existing = pipelines.remove(index);
                let record = self.build_record(existing.id, team_id, team, name, config, Some(&existing));
                pipelines.push(record);
                existing.id
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                pipelines.push(self.build_record(id, team_id, team, name, config, None));
                id
            }
        };

        let count = pipelines
            .iter()
            .map(|p| p.resources.len() + p.resource_types.len())
            .sum();
        self.configs.set_checkable_count(count);
        id
    }

    /// Concrete checkable, for callers that need more than the trait
    #[must_use]
    pub fn checkable(&self, pipeline_id: u64, kind: CheckableKind, name: &str) -> Option<Arc<InMemoryCheckable>> {
        let pipelines = self.pipelines.read();
        let pipeline = pipelines.iter().find(|p| p.id == pipeline_id)?;
        let list = match kind {
            CheckableKind::Resource => &pipeline.resources,
            CheckableKind::ResourceType => &pipeline.resource_types,
        };
        list.iter().find(|c| c.name == name).cloned()
    }

    fn build_record(
        &self,
        id: u64,
        team_id: u64,
        team: &str,
        name: &str,
        config: PipelineConfig,
        previous: Option<&PipelineRecord>,
    ) -> PipelineRecord {
        let reuse = |kind, decl_name: &str, type_name: &str, source: &Source| {
            previous.and_then(|p| {
                p.resources
                    .iter()
                    .chain(p.resource_types.iter())
                    .find(|c| c.declared_as(kind, decl_name, type_name, source))
                    .cloned()
            })
        };

        let resources = config
            .resources
            .iter()
            .map(|r: &Resource| {
                reuse(CheckableKind::Resource, &r.name, &r.type_name, &r.source).unwrap_or_else(|| {
                    Arc::new(self.checkable_for(
                        CheckableKind::Resource,
                        id,
                        name,
                        team_id,
                        team,
                        Declaration {
                            name: &r.name,
                            type_name: &r.type_name,
                            source: &r.source,
                            tags: &r.tags,
                            check_every: r.check_every.as_ref(),
                            check_timeout: r.check_timeout.as_ref(),
                            has_webhook: r.webhook_token.is_some(),
                            version: r.version.as_ref(),
                        },
                    ))
                })
            })
            .collect();

        let resource_types = config
            .resource_types
            .iter()
            .map(|t: &ResourceType| {
                reuse(CheckableKind::ResourceType, &t.name, &t.type_name, &t.source).unwrap_or_else(|| {
                    Arc::new(self.checkable_for(
                        CheckableKind::ResourceType,
                        id,
                        name,
                        team_id,
                        team,
                        Declaration {
                            name: &t.name,
                            type_name: &t.type_name,
                            source: &t.source,
                            tags: &t.tags,
                            check_every: t.check_every.as_ref(),
                            check_timeout: None,
                            has_webhook: false,
                            version: None,
                        },
                    ))
                })
            })
            .collect();

        PipelineRecord {
            id,
            name: name.to_string(),
            team_id,
            team_name: team.to_string(),
            config,
            resources,
            resource_types,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn checkable_for(
        &self,
        kind: CheckableKind,
        pipeline_id: u64,
        pipeline_name: &str,
        team_id: u64,
        team_name: &str,
        decl: Declaration<'_>,
    ) -> InMemoryCheckable {
        InMemoryCheckable {
            kind,
            name: decl.name.to_string(),
            pipeline_id,
            pipeline_name: pipeline_name.to_string(),
            team_id,
            team_name: team_name.to_string(),
            type_name: decl.type_name.to_string(),
            source: decl.source.clone(),
            tags: decl.tags.to_vec(),
            check_every: decl.check_every.cloned(),
            check_timeout: decl.check_timeout.cloned(),
            has_webhook: decl.has_webhook,
            configured_version: decl.version.cloned(),
            configs: Arc::clone(&self.configs),
            state: Mutex::new(CheckableState::default()),
        }
    }

    fn all(&self, kind: CheckableKind) -> Vec<Arc<dyn Checkable>> {
        self.pipelines
            .read()
            .iter()
            .flat_map(|p| match kind {
                CheckableKind::Resource => p.resources.clone(),
                CheckableKind::ResourceType => p.resource_types.clone(),
            })
            .map(|c| c as Arc<dyn Checkable>)
            .collect()
    }

    fn owned_scope(&self, pipeline_id: u64, resource: &str) -> StoreResult<Arc<dyn ResourceConfigScope>> {
        let checkable = self
            .checkable(pipeline_id, CheckableKind::Resource, resource)
            .ok_or_else(|| StoreError::not_found(format!("resource {resource}")))?;
        checkable
            .scope()
            .map(|scope| scope as Arc<dyn ResourceConfigScope>)
            .ok_or_else(|| StoreError::not_found(format!("scope of resource {resource}")))
    }
}

struct Declaration<'a> {
    name: &'a str,
    type_name: &'a str,
    source: &'a Source,
    tags: &'a [String],
    check_every: Option<&'a String>,
    check_timeout: Option<&'a String>,
    has_webhook: bool,
    version: Option<&'a Version>,
}

#[async_trait]
impl ResourceCatalog for InMemoryCatalog {
    async fn resources(&self) -> StoreResult<Vec<Arc<dyn Checkable>>> {
        Ok(self.all(CheckableKind::Resource))
    }

    async fn resource_types(&self) -> StoreResult<Vec<Arc<dyn Checkable>>> {
        Ok(self.all(CheckableKind::ResourceType))
    }

    async fn find_checkable(
        &self,
        pipeline_id: u64,
        kind: CheckableKind,
        name: &str,
    ) -> StoreResult<Option<Arc<dyn Checkable>>> {
        Ok(self
            .checkable(pipeline_id, kind, name)
            .map(|c| c as Arc<dyn Checkable>))
    }

    async fn named_resources(&self, pipeline_id: u64) -> StoreResult<NamedResources> {
        self.pipelines
            .read()
            .iter()
            .find(|p| p.id == pipeline_id)
            .map(|p| NamedResources(p.config.resources.clone()))
            .ok_or_else(|| StoreError::not_found(format!("pipeline {pipeline_id}")))
    }

    async fn versioned_resource_types(&self, pipeline_id: u64) -> StoreResult<VersionedResourceTypes> {
        let declared: Vec<(ResourceType, Option<Arc<super::InMemoryScope>>)> = {
            let pipelines = self.pipelines.read();
            let pipeline = pipelines
                .iter()
                .find(|p| p.id == pipeline_id)
                .ok_or_else(|| StoreError::not_found(format!("pipeline {pipeline_id}")))?;
            pipeline
                .config
                .resource_types
                .iter()
                .map(|t| {
                    let scope = pipeline
                        .resource_types
                        .iter()
                        .find(|c| c.name == t.name)
                        .and_then(|c| c.scope());
                    (t.clone(), scope)
                })
                .collect()
        };

        let mut types = Vec::with_capacity(declared.len());
        for (resource_type, scope) in declared {
            let version = match scope {
                Some(scope) => scope.latest_version().await?.map(|v| v.version),
                None => None,
            };
            types.push(VersionedResourceType::new(resource_type, version));
        }
        Ok(VersionedResourceTypes(types))
    }

    async fn save_resource_version(
        &self,
        pipeline_id: u64,
        resource: &str,
        result: &VersionResult,
    ) -> StoreResult<()> {
        let scope = self.owned_scope(pipeline_id, resource)?;
        scope.update_metadata(&result.version, &result.metadata).await?;
        Ok(())
    }

    async fn save_output(
        &self,
        pipeline_id: u64,
        resource: &str,
        source: &Source,
        resource_types: &VersionedResourceTypes,
        result: &VersionResult,
    ) -> StoreResult<()> {
        let checkable = self
            .checkable(pipeline_id, CheckableKind::Resource, resource)
            .ok_or_else(|| StoreError::not_found(format!("resource {resource}")))?;

        let config = self
            .configs
            .find_or_create_resource_config(&checkable.type_name, source, resource_types)
            .await?;
        let scope = self
            .configs
            .find_or_create_scope(&config, Some(&ResourceKey::new(pipeline_id, resource)))
            .await?;
        scope.save_versions(std::slice::from_ref(&result.version)).await?;
        scope.update_metadata(&result.version, &result.metadata).await?;
        checkable.set_resource_config_scope(scope.id()).await
    }

    async fn save_pipeline(&self, team: &str, name: &str, config: &PipelineConfig) -> StoreResult<bool> {
        let unchanged = self
            .pipelines
            .read()
            .iter()
            .any(|p| p.team_name == team && p.name == name && &p.config == config);
        if unchanged {
            return Ok(false);
        }
        self.add_pipeline(team, name, config.clone());
        Ok(true)
    }

    async fn pipeline(&self, team: &str, name: &str) -> StoreResult<Option<PipelineConfig>> {
        Ok(self
            .pipelines
            .read()
            .iter()
            .find(|p| p.team_name == team && p.name == name)
            .map(|p| p.config.clone()))
    }
}
