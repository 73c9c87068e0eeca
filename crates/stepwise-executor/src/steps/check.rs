use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use stepwise_core::build::BuildMetadata;
use stepwise_core::db::{ResourceConfigFactory, ResourceConfigScope, ResourceKey};
use stepwise_core::duration::format_duration;
use stepwise_core::plan::{CheckPlan, PlanId};
use stepwise_core::resource::{Source, VersionResult};

use super::{flush, owner, report_error, resource_image, Outcome};
use crate::context::StepContext;
use crate::delegate::{release, CheckConfig, CheckDelegate};
use crate::run_state::RunState;
use crate::step::Step;
use crate::worker::{ContainerSpec, ResourceRequest, ScriptOutput, WorkerClient, WorkerError, WorkerSpec};
use crate::{ExecError, ExecResult};

/// Discovers new versions of a resource config and saves them to its scope.
///
/// Whichever version ends up latest in the scope is stored as the node's
/// result, so a get planned after the check fetches it.
pub struct CheckStep {
    plan_id: PlanId,
    plan: CheckPlan,
    metadata: BuildMetadata,
    worker: Arc<dyn WorkerClient>,
    configs: Arc<dyn ResourceConfigFactory>,
    delegate: Arc<dyn CheckDelegate>,
    check_config: CheckConfig,
    outcome: Outcome,
}

impl CheckStep {
    /// Creates a check step
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_id: PlanId,
        plan: CheckPlan,
        metadata: BuildMetadata,
        worker: Arc<dyn WorkerClient>,
        configs: Arc<dyn ResourceConfigFactory>,
        delegate: Arc<dyn CheckDelegate>,
        check_config: CheckConfig,
    ) -> Self {
        Self {
            plan_id,
            plan,
            metadata,
            worker,
            configs,
            delegate,
            check_config,
            outcome: Outcome::default(),
        }
    }

    async fn check(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();

        let timeout = self.check_config.timeout(&self.plan)?;
        let source = state.vars().interpolate_map(&self.plan.source)?;
        let config = self
            .configs
            .find_or_create_resource_config(&self.plan.type_name, &source, &self.plan.resource_types)
            .await?;
        let key = match (self.metadata.pipeline_id, &self.plan.resource) {
            (Some(pipeline_id), Some(resource)) => Some(ResourceKey::new(pipeline_id, resource.clone())),
            _ => None,
        };
        let scope = self.configs.find_or_create_scope(&config, key.as_ref()).await?;

        // once the scope exists the checkable follows it, whatever the outcome
        let result = self.check_scope(ctx, state, scope.as_ref(), source, timeout).await;
        let pointed = self.delegate.point_to_checked_config(scope.as_ref()).await;
        let succeeded = result?;
        pointed?;
        self.delegate.finished(succeeded);
        Ok(succeeded)
    }

    /// Checks the scope, or reuses its latest version when no check is due
    async fn check_scope(
        &self,
        ctx: &StepContext,
        state: &Arc<RunState>,
        scope: &dyn ResourceConfigScope,
        source: Source,
        timeout: Duration,
    ) -> ExecResult<bool> {
        let (lock, run) = self.delegate.wait_to_run(ctx, scope).await?;
        if run {
            let result = self.run_check(ctx, state, scope, source, timeout).await;
            if let Some(lock) = lock {
                release(lock).await;
            }
            return result;
        }

        debug!(scope = scope.id(), "check skipped, reusing latest version");
        if let Some(latest) = scope.latest_version().await? {
            state.store_result(
                &self.plan_id,
                &VersionResult {
                    version: latest.version,
                    metadata: latest.metadata,
                },
            )?;
        }
        Ok(true)
    }

    /// Runs the check script while holding the scope lock
    async fn run_check(
        &self,
        ctx: &StepContext,
        state: &Arc<RunState>,
        scope: &dyn ResourceConfigScope,
        source: Source,
        timeout: Duration,
    ) -> ExecResult<bool> {
        let from_version = match &self.plan.from_version {
            Some(version) => Some(version.clone()),
            None => scope.latest_version().await?.map(|latest| latest.version),
        };
        let image = resource_image(state, &self.plan.type_name, self.plan.image_artifact_name.as_deref())?;

        let worker_spec = WorkerSpec {
            resource_type: image.artifact.is_none().then(|| self.plan.type_name.clone()),
            tags: self.plan.tags.clone(),
            team_id: self.metadata.team_id,
            ..WorkerSpec::default()
        };
        let container = ContainerSpec {
            team_id: self.metadata.team_id,
            image,
            env: self.metadata.env(),
            ..ContainerSpec::default()
        };
        let request = ResourceRequest {
            type_name: self.plan.type_name.clone(),
            source,
            version: from_version,
            resource_types: self.plan.resource_types.clone(),
            ..ResourceRequest::default()
        };
        let mut streams = [self.delegate.stdout(), self.delegate.stderr()];
        let output = ScriptOutput {
            stdout: streams[0].clone(),
            stderr: streams[1].clone(),
        };

        scope.update_last_check_start_time().await?;
        self.delegate.starting();
        info!(scope = scope.id(), type_name = %self.plan.type_name, "checking for new versions");

        let timeout_ctx = ctx.with_timeout(timeout);
        let outcome = timeout_ctx
            .run(self.worker.run_check_step(
                &timeout_ctx,
                owner(&self.metadata, &self.plan_id),
                container,
                worker_spec,
                request,
                output,
                self.delegate.as_ref(),
                timeout,
            ))
            .await;
        flush(&mut streams);

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err @ WorkerError::ScriptFailed { .. })) => {
                warn!(scope = scope.id(), error = %err, "check script failed");
                scope.set_check_error(Some(err.to_string())).await?;
                return Ok(false);
            }
            Ok(Err(err)) => {
                scope.set_check_error(Some(err.to_string())).await?;
                return Err(ExecError::from(err).in_step(format!("check {}", self.plan.name)));
            }
            Err(err) if err.is_deadline_exceeded() && ctx.err().is_none() => {
                let message = format!("timed out after {}", format_duration(timeout));
                scope.set_check_error(Some(message.clone())).await?;
                return Err(err.in_step(format!("check {}: {message}", self.plan.name)));
            }
            Err(err) => return Err(err),
        };

        scope.set_check_error(None).await?;
        scope.save_versions(&result.versions).await?;
        let latest = match result.versions.last() {
            Some(version) => Some(VersionResult::new(version.clone())),
            None => scope.latest_version().await?.map(|latest| VersionResult {
                version: latest.version,
                metadata: latest.metadata,
            }),
        };
        if let Some(latest) = latest {
            state.store_result(&self.plan_id, &latest)?;
        }
        scope.update_last_check_end_time().await?;
        info!(scope = scope.id(), found = result.versions.len(), "check finished");
        Ok(true)
    }
}

#[async_trait]
impl Step for CheckStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = self.check(&ctx, &state).await;
        report_error(self.delegate.as_ref(), &result);
        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::CheckStepDelegate;
    use crate::limiter::{CheckRateLimiter, LimiterConfig};
    use crate::steps::testing::{events, state, version, FakeWorker, WorkerCall};
    use crate::worker::CheckResult;
    use crate::ExecErrorKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use stepwise_core::db::memory::{
        InMemoryBuildStore, InMemoryCatalog, InMemoryLockFactory, InMemoryResourceConfigFactory,
    };
    use stepwise_core::db::{Build, BuildStore, Checkable, CheckableKind};
    use stepwise_core::pipeline::PipelineConfig;
    use stepwise_core::plan::{PlanFactory, PlanKind};
    use stepwise_core::resource::{Resource, Version};
    use stepwise_events::{BuildEvent, InMemoryEventStore};

    struct Fixture {
        configs: Arc<InMemoryResourceConfigFactory>,
        catalog: Arc<InMemoryCatalog>,
        builds: InMemoryBuildStore,
        store: Arc<InMemoryEventStore>,
        pipeline_id: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let locks = InMemoryLockFactory::new();
            let configs = Arc::new(InMemoryResourceConfigFactory::new(locks.clone()));
            let catalog = Arc::new(InMemoryCatalog::new(configs.clone()));
            let pipeline_id = catalog.add_pipeline(
                "main",
                "ci",
                PipelineConfig {
                    resources: vec![Resource::new("repo", "git")],
                    ..PipelineConfig::default()
                },
            );
            Self {
                configs,
                catalog,
                builds: InMemoryBuildStore::new(locks),
                store: Arc::new(InMemoryEventStore::new()),
                pipeline_id,
            }
        }

        async fn step(&self, plan: CheckPlan, worker: &Arc<FakeWorker>) -> CheckStep {
            let checkable = self
                .catalog
                .checkable(self.pipeline_id, CheckableKind::Resource, "repo")
                .unwrap();
            let root = PlanFactory::new(0).new_plan(PlanKind::Check(plan.clone()));
            let build: Arc<dyn Build> = self
                .builds
                .create_check_build(checkable.as_ref(), root, false)
                .await
                .unwrap()
                .unwrap();
            let limiter = Arc::new(CheckRateLimiter::new(
                &LimiterConfig {
                    max_checks_per_second: -1.0,
                    ..LimiterConfig::default()
                },
                self.configs.clone(),
            ));
            let delegate = CheckStepDelegate::new(
                events(&self.store, "1"),
                plan.clone(),
                Arc::clone(&build),
                self.catalog.clone(),
                limiter,
                CheckConfig::default(),
            );
            CheckStep::new(
                PlanId::new("1"),
                plan,
                build.metadata().clone(),
                Arc::clone(worker) as Arc<dyn WorkerClient>,
                self.configs.clone(),
                Arc::new(delegate),
                CheckConfig::default(),
            )
        }

        async fn scope(&self) -> Arc<dyn ResourceConfigScope> {
            let config = self
                .configs
                .find_or_create_resource_config("git", &Source::new(), &Default::default())
                .await
                .unwrap();
            self.configs
                .find_or_create_scope(&config, Some(&ResourceKey::new(self.pipeline_id, "repo")))
                .await
                .unwrap()
        }
    }

    fn plan() -> CheckPlan {
        CheckPlan {
            name: "repo".into(),
            resource: Some("repo".into()),
            type_name: "git".into(),
            ..CheckPlan::default()
        }
    }

    fn worker(results: Vec<Result<CheckResult, WorkerError>>) -> Arc<FakeWorker> {
        let worker = FakeWorker::default();
        worker.check_results.lock().extend(results);
        Arc::new(worker)
    }

    fn found(versions: &[Version]) -> Result<CheckResult, WorkerError> {
        Ok(CheckResult {
            versions: versions.to_vec(),
        })
    }

    #[tokio::test]
    async fn saves_new_versions_and_stores_the_latest() {
        let fixture = Fixture::new();
        let worker = worker(vec![found(&[version("v1"), version("v2")])]);
        let state = state();

        let step = fixture.step(plan(), &worker).await;
        assert!(step.run(StepContext::background(), state.clone()).await.unwrap());

        let scope = fixture.scope().await;
        assert_eq!(scope.versions().await.unwrap().len(), 2);
        assert_eq!(
            state.result::<VersionResult>(&PlanId::new("1")).map(|r| r.version),
            Some(version("v2"))
        );
        assert!(scope.last_check_end_time().await.unwrap().is_some());
        assert!(scope.acquire_checking_lock().await.unwrap().is_some());

        let checkable = fixture
            .catalog
            .checkable(fixture.pipeline_id, CheckableKind::Resource, "repo")
            .unwrap();
        assert_eq!(checkable.resource_config_scope_id().await.unwrap(), Some(scope.id()));
    }

    #[tokio::test]
    async fn checks_from_the_latest_saved_version() {
        let fixture = Fixture::new();
        let scope = fixture.scope().await;
        scope.save_versions(&[version("v1")]).await.unwrap();
        let worker = worker(vec![found(&[])]);
        let state = state();

        let step = fixture.step(plan(), &worker).await;
        assert!(step.run(StepContext::background(), state.clone()).await.unwrap());

        let WorkerCall::Check(request) = &worker.calls()[0] else {
            panic!("expected a check");
        };
        assert_eq!(request.version, Some(version("v1")));
        assert_eq!(
            state.result::<VersionResult>(&PlanId::new("1")).map(|r| r.version),
            Some(version("v1"))
        );
    }

    #[tokio::test]
    async fn script_failure_is_recorded_on_the_scope() {
        let fixture = Fixture::new();
        let worker = worker(vec![Err(WorkerError::ScriptFailed {
            script: "check".into(),
            exit_status: 1,
            stderr: "bad credentials".into(),
        })]);

        let step = fixture.step(plan(), &worker).await;
        assert!(!step.run(StepContext::background(), state()).await.unwrap());

        let scope = fixture.scope().await;
        let error = scope.check_error().await.unwrap().unwrap();
        assert!(error.contains("bad credentials"));
        assert!(scope.acquire_checking_lock().await.unwrap().is_some());
        assert!(fixture.store.build_events(1).iter().any(|event| matches!(
            event,
            BuildEvent::Finish {
                succeeded: false,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn worker_errors_fail_the_step() {
        let fixture = Fixture::new();
        let worker = worker(vec![Err(WorkerError::NoWorkers {
            constraints: "platform linux".into(),
        })]);

        let step = fixture.step(plan(), &worker).await;
        let err = step.run(StepContext::background(), state()).await.unwrap_err();

        assert!(matches!(err.kind(), ExecErrorKind::Step { .. }));
        let scope = fixture.scope().await;
        assert!(scope.check_error().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn check_that_is_not_due_reuses_the_latest_version() {
        let fixture = Fixture::new();
        let scope = fixture.scope().await;
        scope.save_versions(&[version("v1")]).await.unwrap();
        fixture
            .configs
            .scope(scope.id())
            .unwrap()
            .set_last_check_end_time(Some(Utc::now()));
        let worker = worker(Vec::new());
        let state = state();

        let step = fixture.step(plan(), &worker).await;
        assert!(step.run(StepContext::background(), state.clone()).await.unwrap());

        assert!(worker.calls().is_empty());
        assert_eq!(
            state.result::<VersionResult>(&PlanId::new("1")).map(|r| r.version),
            Some(version("v1"))
        );
    }

    #[tokio::test]
    async fn missing_type_image_still_points_the_checkable_at_the_scope() {
        let fixture = Fixture::new();
        let worker = worker(Vec::new());
        let plan = CheckPlan {
            image_artifact_name: Some("type:custom".into()),
            ..plan()
        };

        let step = fixture.step(plan, &worker).await;
        let err = step.run(StepContext::background(), state()).await.unwrap_err();

        assert!(matches!(err.kind(), ExecErrorKind::ArtifactNotFound { .. }));
        assert!(worker.calls().is_empty());
        let scope = fixture.scope().await;
        let checkable = fixture
            .catalog
            .checkable(fixture.pipeline_id, CheckableKind::Resource, "repo")
            .unwrap();
        assert_eq!(checkable.resource_config_scope_id().await.unwrap(), Some(scope.id()));
        assert!(scope.acquire_checking_lock().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_timeout_is_an_error() {
        let fixture = Fixture::new();
        let worker = worker(Vec::new());
        let plan = CheckPlan {
            timeout: "soon".into(),
            ..plan()
        };

        let step = fixture.step(plan, &worker).await;
        let err = step.run(StepContext::background(), state()).await.unwrap_err();
        assert!(matches!(err.kind(), ExecErrorKind::InvalidDuration { .. }));
        assert!(worker.calls().is_empty());
    }
}
