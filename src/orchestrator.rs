//! Wires the scheduler loops to the engine.
//!
//! The [`Orchestrator`] owns one scanner and one checker, each ticked by
//! its own periodic loop, and the engine both feed. Shutdown stops the
//! loops first and then drains the engine so running builds are released
//! to the next orchestrator instead of being finished.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stepwise_core::db::memory::{
    InMemoryBuildStore, InMemoryCatalog, InMemoryLockFactory, InMemoryResourceCacheFactory,
    InMemoryResourceConfigFactory,
};
use stepwise_core::db::{
    Build, BuildStore, CheckableKind, ResourceCacheFactory, ResourceCatalog, ResourceConfigFactory,
};
use stepwise_events::{BuildEventStore, InMemoryEventStore, NotificationBus};
use stepwise_executor::{Builder, CheckRateLimiter, Engine, Secrets, WorkerClient};
use stepwise_scheduler::{Checker, Component, Scanner, run_periodically};

use crate::infrastructure::Config;

/// The stores an orchestrator reads and writes
#[derive(Clone)]
pub struct Stores {
    /// Pipelines and their checkables
    pub catalog: Arc<dyn ResourceCatalog>,
    /// Builds
    pub builds: Arc<dyn BuildStore>,
    /// Resource configs and their scopes
    pub configs: Arc<dyn ResourceConfigFactory>,
    /// Fetched resource caches
    pub caches: Arc<dyn ResourceCacheFactory>,
    /// Build events
    pub events: Arc<dyn BuildEventStore>,
}

impl Stores {
    /// Stores that live in memory and share one lock table
    #[must_use]
    pub fn in_memory() -> Self {
        let locks = InMemoryLockFactory::new();
        let configs = Arc::new(InMemoryResourceConfigFactory::new(locks.clone()));
        Self {
            catalog: Arc::new(InMemoryCatalog::new(Arc::clone(&configs))),
            builds: Arc::new(InMemoryBuildStore::new(locks)),
            configs,
            caches: Arc::new(InMemoryResourceCacheFactory::new()),
            events: Arc::new(InMemoryEventStore::new()),
        }
    }
}

/// Runs checks and builds until shut down
pub struct Orchestrator {
    config: Config,
    stores: Stores,
    engine: Arc<Engine>,
    scanner: Arc<Scanner>,
    checker: Arc<Checker>,
}

impl Orchestrator {
    /// Creates an orchestrator running containers through `worker`
    pub fn new(config: &Config, stores: Stores, worker: Arc<dyn WorkerClient>, secrets: Arc<dyn Secrets>) -> Self {
        let limiter = Arc::new(CheckRateLimiter::new(&config.limiter(), Arc::clone(&stores.configs)));
        let builder = Builder::new(
            worker,
            Arc::clone(&stores.configs),
            Arc::clone(&stores.caches),
            Arc::clone(&stores.catalog),
            Arc::clone(&stores.events),
            secrets,
            limiter,
            config.checks(),
            config.redact_secrets,
        );
        let engine = Arc::new(Engine::new(Arc::new(builder), Arc::clone(&stores.events)));

        let bus = Arc::new(NotificationBus::new());
        let scanner = Scanner::new(
            Arc::clone(&stores.catalog),
            Arc::clone(&stores.builds),
            Arc::clone(&bus),
            config.scanner(),
        );
        let checker = Checker::new(Arc::clone(&stores.builds), Arc::clone(&engine), &bus);

        Self {
            config: config.clone(),
            stores,
            engine,
            scanner: Arc::new(scanner),
            checker: Arc::new(checker),
        }
    }

    /// The engine running this orchestrator's builds
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The stores this orchestrator works on
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Creates a manually triggered check for one checkable, skipping its interval.
    ///
    /// Returns `None` when a check for it is already pending.
    ///
    /// # Errors
    ///
    /// Fails when the checkable does not exist or its check cannot be planned.
    pub async fn trigger_check(
        &self,
        pipeline_id: u64,
        kind: CheckableKind,
        name: &str,
    ) -> anyhow::Result<Option<Arc<dyn Build>>> {
        let checkable = self
            .stores
            .catalog
            .find_checkable(pipeline_id, kind, name)
            .await?
            .with_context(|| format!("{kind} '{name}' not found in pipeline {pipeline_id}"))?;
        Ok(self.scanner.trigger(checkable).await?)
    }

    /// Runs the scanner and checker loops until `shutdown` fires, then
    /// drains the engine.
    ///
    /// # Errors
    ///
    /// Fails when a loop panicked.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            scanner_interval = ?self.config.scanner_interval,
            checker_interval = ?self.config.checker_interval,
            "orchestrator started"
        );

        let scanner = tokio::spawn(run_periodically(
            "scanner",
            self.config.scanner_interval,
            shutdown.clone(),
            Arc::clone(&self.scanner) as Arc<dyn Component>,
        ));
        let checker = tokio::spawn(run_periodically(
            "checker",
            self.config.checker_interval,
            shutdown.clone(),
            Arc::clone(&self.checker) as Arc<dyn Component>,
        ));

        shutdown.cancelled().await;
        scanner.await.context("scanner loop panicked")?;
        checker.await.context("checker loop panicked")?;

        if tokio::time::timeout(self.config.drain_timeout, self.engine.drain())
            .await
            .is_err()
        {
            warn!(timeout = ?self.config.drain_timeout, "builds still running after drain timeout");
        }
        info!("orchestrator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use stepwise_core::build::BuildStatus;
    use stepwise_core::db::{Checkable, ResourceCache};
    use stepwise_core::pipeline::PipelineConfig;
    use stepwise_core::resource::{Resource, Version};
    use stepwise_executor::artifact::Artifact;
    use stepwise_executor::worker::{
        CheckResult, ContainerOwner, ContainerSpec, GetResult, ProcessSpec, PutResult, ResourceRequest,
        ScriptOutput, TaskResult, WorkerError, WorkerSpec,
    };
    use stepwise_executor::{BuildStepDelegate, StaticSecrets, StepContext};

    #[derive(Default)]
    struct CheckingWorker {
        checks: AtomicUsize,
    }

    fn unsupported(what: &str) -> WorkerError {
        WorkerError::Container {
            reason: format!("{what} not supported"),
        }
    }

    #[async_trait]
    impl WorkerClient for CheckingWorker {
        async fn run_check_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            _container: ContainerSpec,
            _worker: WorkerSpec,
            _request: ResourceRequest,
            _output: ScriptOutput,
            _delegate: &dyn BuildStepDelegate,
            _timeout: Duration,
        ) -> Result<CheckResult, WorkerError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(CheckResult {
                versions: vec![Version::from([("ref".to_string(), "v1".to_string())])],
            })
        }

        async fn run_get_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            _container: ContainerSpec,
            _worker: WorkerSpec,
            _request: ResourceRequest,
            _cache: &ResourceCache,
            _output: ScriptOutput,
            _delegate: &dyn BuildStepDelegate,
        ) -> Result<GetResult, WorkerError> {
            Err(unsupported("get"))
        }

        async fn run_put_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            _container: ContainerSpec,
            _worker: WorkerSpec,
            _request: ResourceRequest,
            _output: ScriptOutput,
            _delegate: &dyn BuildStepDelegate,
        ) -> Result<PutResult, WorkerError> {
            Err(unsupported("put"))
        }

        async fn run_task_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            _container: ContainerSpec,
            _worker: WorkerSpec,
            _process: ProcessSpec,
            _delegate: &dyn BuildStepDelegate,
        ) -> Result<TaskResult, WorkerError> {
            Err(unsupported("task"))
        }

        async fn stream_file(
            &self,
            _ctx: &StepContext,
            artifact: &dyn Artifact,
            path: &str,
        ) -> Result<Vec<u8>, WorkerError> {
            Err(WorkerError::FileNotFound {
                artifact: artifact.id().to_string(),
                path: path.to_string(),
            })
        }
    }

    struct Fixture {
        builds: Arc<InMemoryBuildStore>,
        catalog: Arc<InMemoryCatalog>,
        worker: Arc<CheckingWorker>,
        orchestrator: Arc<Orchestrator>,
        pipeline_id: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let locks = InMemoryLockFactory::new();
            let configs = Arc::new(InMemoryResourceConfigFactory::new(locks.clone()));
            let catalog = Arc::new(InMemoryCatalog::new(Arc::clone(&configs)));
            let pipeline_id = catalog.add_pipeline(
                "main",
                "ci",
                PipelineConfig {
                    resources: vec![Resource::new("repo", "git")],
                    ..PipelineConfig::default()
                },
            );
            let builds = Arc::new(InMemoryBuildStore::new(locks));
            let stores = Stores {
                catalog: catalog.clone(),
                builds: builds.clone(),
                configs,
                caches: Arc::new(InMemoryResourceCacheFactory::new()),
                events: Arc::new(InMemoryEventStore::new()),
            };
            let config = Config {
                max_checks_per_second: -1.0,
                ..Config::default()
            };
            let worker = Arc::new(CheckingWorker::default());
            let orchestrator = Arc::new(Orchestrator::new(
                &config,
                stores,
                worker.clone(),
                Arc::new(StaticSecrets::new()),
            ));
            Self {
                builds,
                catalog,
                worker,
                orchestrator,
                pipeline_id,
            }
        }

        async fn wait_for(&self, status: BuildStatus) -> u64 {
            for _ in 0..100 {
                if let Some(build) = self
                    .builds
                    .all_builds()
                    .into_iter()
                    .find(|b| b.current_status() == status)
                {
                    return build.id();
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            panic!("no build reached {status}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scans_and_runs_checks_until_shut_down() {
        let fixture = Fixture::new();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let orchestrator = Arc::clone(&fixture.orchestrator);
            let shutdown = shutdown.clone();
            async move { orchestrator.run(shutdown).await }
        });

        fixture.wait_for(BuildStatus::Succeeded).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(fixture.worker.checks.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.builds.all_builds().len(), 1);
        let repo = fixture
            .catalog
            .checkable(fixture.pipeline_id, CheckableKind::Resource, "repo")
            .unwrap();
        assert!(repo.resource_config_scope_id().await.unwrap().is_some());
        assert!(fixture.orchestrator.engine().registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn triggered_checks_run_even_when_recently_checked() {
        let fixture = Fixture::new();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let orchestrator = Arc::clone(&fixture.orchestrator);
            let shutdown = shutdown.clone();
            async move { orchestrator.run(shutdown).await }
        });
        let first = fixture.wait_for(BuildStatus::Succeeded).await;

        let triggered = fixture
            .orchestrator
            .trigger_check(fixture.pipeline_id, CheckableKind::Resource, "repo")
            .await
            .unwrap()
            .unwrap();
        assert!(triggered.is_manually_triggered());
        assert!(triggered.id() != first);

        for _ in 0..100 {
            if fixture.builds.build(triggered.id()).unwrap().current_status() == BuildStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(
            fixture.builds.build(triggered.id()).unwrap().current_status(),
            BuildStatus::Succeeded
        );
        assert_eq!(fixture.worker.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn triggering_unknown_checkables_fails() {
        let fixture = Fixture::new();
        let Err(err) = fixture
            .orchestrator
            .trigger_check(fixture.pipeline_id, CheckableKind::Resource, "missing")
            .await
        else {
            panic!("expected an unknown checkable to fail");
        };
        assert!(err.to_string().contains("'missing' not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stores_shut_down_cleanly() {
        let orchestrator = Orchestrator::new(
            &Config::default(),
            Stores::in_memory(),
            Arc::new(CheckingWorker::default()),
            Arc::new(StaticSecrets::new()),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        orchestrator.run(shutdown).await.unwrap();
        assert!(orchestrator.engine().registry().is_empty());
    }
}
