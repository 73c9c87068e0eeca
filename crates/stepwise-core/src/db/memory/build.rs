use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use super::InMemoryLockFactory;
use crate::build::{BuildMetadata, BuildStatus};
use crate::db::{Build, BuildStore, Checkable, CheckableKind, Lock, LockFactory, LockId, StoreResult};
use crate::plan::Plan;

/// A build kept in memory
#[derive(Debug)]
pub struct InMemoryBuild {
    metadata: BuildMetadata,
    plan: Plan,
    manually_triggered: bool,
    check: bool,
    status: Mutex<BuildStatus>,
    abort: CancellationToken,
    locks: InMemoryLockFactory,
}

impl InMemoryBuild {
    /// Current status without going through the async trait
    #[must_use]
    pub fn current_status(&self) -> BuildStatus {
        *self.status.lock()
    }
}

#[async_trait]
impl Build for InMemoryBuild {
    fn id(&self) -> u64 {
        self.metadata.build_id
    }

    fn metadata(&self) -> &BuildMetadata {
        &self.metadata
    }

    fn is_manually_triggered(&self) -> bool {
        self.manually_triggered
    }

    async fn plan(&self) -> StoreResult<Plan> {
        Ok(self.plan.clone())
    }

    async fn reload(&self) -> StoreResult<bool> {
        Ok(true)
    }

    async fn status(&self) -> StoreResult<BuildStatus> {
        Ok(self.current_status())
    }

    async fn acquire_tracking_lock(&self) -> StoreResult<Option<Box<dyn Lock>>> {
        self.locks.acquire(LockId::BuildTracking(self.id())).await
    }

    fn abort_signal(&self) -> CancellationToken {
        self.abort.clone()
    }

    async fn finish(&self, status: BuildStatus) -> StoreResult<()> {
        *self.status.lock() = status;
        Ok(())
    }
}

/// Builds kept in memory
#[derive(Debug, Default)]
pub struct InMemoryBuildStore {
    locks: InMemoryLockFactory,
    builds: DashMap<u64, Arc<InMemoryBuild>>,
    check_builds: DashMap<(u64, CheckableKind, String), u64>,
    next_id: AtomicU64,
}

impl InMemoryBuildStore {
    /// Creates an empty store whose builds lock through `locks`
    #[must_use]
    pub fn new(locks: InMemoryLockFactory) -> Self {
        Self {
            locks,
            ..Self::default()
        }
    }

    /// Concrete build by ID
    #[must_use]
    pub fn build(&self, id: u64) -> Option<Arc<InMemoryBuild>> {
        self.builds.get(&id).map(|build| Arc::clone(build.value()))
    }

    /// Every build ever created, in ID order
    #[must_use]
    pub fn all_builds(&self) -> Vec<Arc<InMemoryBuild>> {
        let mut builds: Vec<_> = self.builds.iter().map(|b| Arc::clone(b.value())).collect();
        builds.sort_by_key(|b| b.metadata.build_id);
        builds
    }

    fn insert(&self, mut metadata: BuildMetadata, plan: Plan, manually_triggered: bool, check: bool) -> Arc<InMemoryBuild> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        metadata.build_id = id;
        if metadata.build_name.is_empty() {
            metadata.build_name = id.to_string();
        }
        let build = Arc::new(InMemoryBuild {
            metadata,
            plan,
            manually_triggered,
            check,
            status: Mutex::new(BuildStatus::Started),
            abort: CancellationToken::new(),
            locks: self.locks.clone(),
        });
        self.builds.insert(id, Arc::clone(&build));
        build
    }
}

#[async_trait]
impl BuildStore for InMemoryBuildStore {
    async fn create_check_build(
        &self,
        checkable: &dyn Checkable,
        plan: Plan,
        manually_triggered: bool,
    ) -> StoreResult<Option<Arc<dyn Build>>> {
        let key = (checkable.pipeline_id(), checkable.kind(), checkable.name().to_string());
        if let Some(existing) = self.check_builds.get(&key).and_then(|id| self.build(*id)) {
            if existing.current_status().is_running() {
                return Ok(None);
            }
        }

        let metadata = BuildMetadata {
            build_name: format!("check-{}", checkable.name()),
            team_id: checkable.team_id(),
            team_name: checkable.team_name().to_string(),
            pipeline_id: Some(checkable.pipeline_id()),
            pipeline_name: Some(checkable.pipeline_name().to_string()),
            ..BuildMetadata::default()
        };
        let build = self.insert(metadata, plan, manually_triggered, true);
        self.check_builds.insert(key, build.id());
        Ok(Some(build as Arc<dyn Build>))
    }

    async fn create_build(&self, metadata: BuildMetadata, plan: Plan) -> StoreResult<Arc<dyn Build>> {
        Ok(self.insert(metadata, plan, false, false) as Arc<dyn Build>)
    }

    async fn started_builds(&self) -> StoreResult<Vec<Arc<dyn Build>>> {
        Ok(self
            .all_builds()
            .into_iter()
            .filter(|b| b.current_status().is_running())
            .map(|b| b as Arc<dyn Build>)
            .collect())
    }

    async fn started_check_builds(&self) -> StoreResult<Vec<Arc<dyn Build>>> {
        let mut builds: Vec<_> = self
            .all_builds()
            .into_iter()
            .filter(|b| b.check && b.current_status().is_running())
            .collect();
        builds.sort_by_key(|b| (!b.manually_triggered, b.metadata.build_id));
        Ok(builds.into_iter().map(|b| b as Arc<dyn Build>).collect())
    }

    async fn find_build(&self, id: u64) -> StoreResult<Option<Arc<dyn Build>>> {
        Ok(self.build(id).map(|b| b as Arc<dyn Build>))
    }

    async fn abort_build(&self, id: u64) -> StoreResult<bool> {
        match self.build(id) {
            Some(build) if build.current_status().is_running() => {
                build.abort.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{InMemoryCatalog, InMemoryResourceConfigFactory};
    use crate::db::ResourceCatalog;
    use crate::pipeline::PipelineConfig;
    use crate::plan::{PlanFactory, PlanKind};
    use crate::resource::Resource;

    #[tokio::test]
    async fn one_running_check_build_per_checkable() {
        let locks = InMemoryLockFactory::new();
        let catalog = InMemoryCatalog::new(Arc::new(InMemoryResourceConfigFactory::new(locks.clone())));
        catalog.add_pipeline(
            "main",
            "ci",
            PipelineConfig {
                resources: vec![Resource::new("repo", "git")],
                ..PipelineConfig::default()
            },
        );
        let repo = catalog.resources().await.expect("resources").remove(0);
        let store = InMemoryBuildStore::new(locks);
        let plan = PlanFactory::new(0).new_plan(PlanKind::Do(Vec::new()));

        let first = store
            .create_check_build(repo.as_ref(), plan.clone(), false)
            .await
            .expect("store ok")
            .expect("created");
        assert!(
            store
                .create_check_build(repo.as_ref(), plan.clone(), false)
                .await
                .expect("store ok")
                .is_none()
        );

        first.finish(BuildStatus::Succeeded).await.expect("finished");
        assert!(
            store
                .create_check_build(repo.as_ref(), plan, true)
                .await
                .expect("store ok")
                .is_some()
        );
        assert_eq!(store.started_builds().await.expect("builds").len(), 1);
    }

    #[tokio::test]
    async fn aborting_signals_the_build() {
        let store = InMemoryBuildStore::new(InMemoryLockFactory::new());
        let plan = PlanFactory::new(0).new_plan(PlanKind::Do(Vec::new()));
        let build = store
            .create_build(BuildMetadata::default(), plan)
            .await
            .expect("created");

        let signal = build.abort_signal();
        assert!(store.abort_build(build.id()).await.expect("store ok"));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn started_check_builds_put_manual_checks_first() {
        let locks = InMemoryLockFactory::new();
        let catalog = InMemoryCatalog::new(Arc::new(InMemoryResourceConfigFactory::new(locks.clone())));
        catalog.add_pipeline(
            "main",
            "ci",
            PipelineConfig {
                resources: vec![Resource::new("repo", "git"), Resource::new("image", "registry-image")],
                ..PipelineConfig::default()
            },
        );
        let resources = catalog.resources().await.expect("resources");
        let store = InMemoryBuildStore::new(locks);
        let plan = PlanFactory::new(0).new_plan(PlanKind::Do(Vec::new()));

        store
            .create_build(BuildMetadata::default(), plan.clone())
            .await
            .expect("created");
        let periodic = store
            .create_check_build(resources[0].as_ref(), plan.clone(), false)
            .await
            .expect("store ok")
            .expect("created");
        let manual = store
            .create_check_build(resources[1].as_ref(), plan, true)
            .await
            .expect("store ok")
            .expect("created");

        let ids: Vec<u64> = store
            .started_check_builds()
            .await
            .expect("builds")
            .iter()
            .map(|build| build.id())
            .collect();
        assert_eq!(ids, vec![manual.id(), periodic.id()]);
    }
}
