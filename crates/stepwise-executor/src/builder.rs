//! Turns plans into steps.
//!
//! [`StepFactory`] maps every plan variant to its step, recursively for
//! combinators. It also runs plans built on demand, such as the image
//! check and get a task schedules for its image resource.

use async_trait::async_trait;
use std::sync::Arc;

use stepwise_core::build::BuildMetadata;
use stepwise_core::db::{Build, ResourceCacheFactory, ResourceCatalog, ResourceConfigFactory};
use stepwise_core::plan::{HookPlan, Plan, PlanId, PlanKind};
use stepwise_events::BuildEventStore;

use crate::context::StepContext;
use crate::delegate::{BuildDelegateFactory, CheckConfig, DelegateFactory};
use crate::limiter::CheckRateLimiter;
use crate::run_state::{PlanRunner, RunState};
use crate::step::StepRef;
use crate::steps::{
    AcrossStep, AggregateStep, CheckStep, DoStep, GetStep, HookStep, HookTrigger, InParallelStep, LoadVarStep,
    PutStep, RetryStep, ScopedStep, SetPipelineStep, TaskStep, TimeoutStep, TryStep,
};
use crate::vars::{BuildVariables, Secrets};
use crate::worker::WorkerClient;
use crate::ExecResult;

/// Builds the steps of one build
pub struct StepFactory {
    delegates: Arc<dyn DelegateFactory>,
    worker: Arc<dyn WorkerClient>,
    configs: Arc<dyn ResourceConfigFactory>,
    caches: Arc<dyn ResourceCacheFactory>,
    catalog: Arc<dyn ResourceCatalog>,
    metadata: BuildMetadata,
    check_config: CheckConfig,
}

impl StepFactory {
    /// Creates a factory for the build described by `metadata`
    pub fn new(
        delegates: Arc<dyn DelegateFactory>,
        worker: Arc<dyn WorkerClient>,
        configs: Arc<dyn ResourceConfigFactory>,
        caches: Arc<dyn ResourceCacheFactory>,
        catalog: Arc<dyn ResourceCatalog>,
        metadata: BuildMetadata,
        check_config: CheckConfig,
    ) -> Self {
        Self {
            delegates,
            worker,
            configs,
            caches,
            catalog,
            metadata,
            check_config,
        }
    }

    /// Builds the step tree for `plan`
    #[must_use]
    pub fn build(&self, plan: &Plan) -> StepRef {
        let id = &plan.id;
        match &plan.kind {
            PlanKind::Task(task) => Arc::new(TaskStep::new(
                id.clone(),
                task.clone(),
                self.metadata.clone(),
                Arc::clone(&self.worker),
                self.delegates.task_delegate(id),
            )),
            PlanKind::Check(check) => Arc::new(CheckStep::new(
                id.clone(),
                check.clone(),
                self.metadata.clone(),
                Arc::clone(&self.worker),
                Arc::clone(&self.configs),
                self.delegates.check_delegate(id, check),
                self.check_config.clone(),
            )),
            PlanKind::Get(get) => Arc::new(GetStep::new(
                id.clone(),
                get.clone(),
                self.metadata.clone(),
                Arc::clone(&self.worker),
                Arc::clone(&self.caches),
                self.delegates.get_delegate(id),
            )),
            PlanKind::Put(put) => Arc::new(PutStep::new(
                id.clone(),
                put.clone(),
                self.metadata.clone(),
                Arc::clone(&self.worker),
                self.delegates.put_delegate(id),
            )),
            PlanKind::Do(plans) => Arc::new(DoStep::new(self.build_all(plans))),
            PlanKind::Aggregate(plans) => Arc::new(AggregateStep::new(self.build_all(plans))),
            PlanKind::InParallel(parallel) => Arc::new(InParallelStep::new(
                self.build_all(&parallel.steps),
                parallel.limit,
                parallel.fail_fast,
            )),
            PlanKind::Across(across) => {
                let steps = across
                    .steps
                    .iter()
                    .map(|scoped| {
                        Arc::new(ScopedStep::new(&across.vars, &scoped.values, self.build(&scoped.step))) as StepRef
                    })
                    .collect();
                Arc::new(AcrossStep::new(
                    across.vars.clone(),
                    steps,
                    across.fail_fast,
                    self.delegates.build_step_delegate(id),
                ))
            }
            PlanKind::Try(try_plan) => Arc::new(TryStep::new(self.build(&try_plan.step))),
            PlanKind::Timeout(timeout) => Arc::new(TimeoutStep::new(timeout.duration.clone(), self.build(&timeout.step))),
            PlanKind::Retry(attempts) => Arc::new(RetryStep::new(self.build_all(attempts))),
            PlanKind::OnSuccess(hook) => self.hook(HookTrigger::OnSuccess, hook),
            PlanKind::OnFailure(hook) => self.hook(HookTrigger::OnFailure, hook),
            PlanKind::OnAbort(hook) => self.hook(HookTrigger::OnAbort, hook),
            PlanKind::OnError(hook) => self.hook(HookTrigger::OnError, hook),
            PlanKind::Ensure(hook) => self.hook(HookTrigger::Ensure, hook),
            PlanKind::SetPipeline(set_pipeline) => Arc::new(SetPipelineStep::new(
                set_pipeline.clone(),
                self.metadata.clone(),
                Arc::clone(&self.worker),
                Arc::clone(&self.catalog),
                self.delegates.build_step_delegate(id),
            )),
            PlanKind::LoadVar(load_var) => Arc::new(LoadVarStep::new(
                load_var.clone(),
                Arc::clone(&self.worker),
                self.delegates.build_step_delegate(id),
            )),
        }
    }

    fn build_all(&self, plans: &[Plan]) -> Vec<StepRef> {
        plans.iter().map(|plan| self.build(plan)).collect()
    }

    fn hook(&self, trigger: HookTrigger, hook: &HookPlan) -> StepRef {
        Arc::new(HookStep::new(trigger, self.build(&hook.step), self.build(&hook.next)))
    }
}

#[async_trait]
impl PlanRunner for StepFactory {
    async fn run_plan(&self, ctx: StepContext, plan: &Plan, state: Arc<RunState>) -> ExecResult<bool> {
        tracing::debug!(plan = %plan.id, kind = plan.kind_name(), "running plan on demand");
        self.build(plan).run(ctx, state).await
    }
}

/// A build's root step with what it needs to run
pub struct BuiltStep {
    /// ID of the root plan
    pub plan_id: PlanId,
    /// The root step
    pub step: StepRef,
    /// Runs plans scheduled while the build runs
    pub runner: Arc<dyn PlanRunner>,
    /// The build's variables
    pub vars: Arc<BuildVariables>,
}

/// Builds the root step of a build
#[async_trait]
pub trait StepBuilder: Send + Sync {
    /// Builds `build`'s plan.
    ///
    /// `vars` carries the variables of an earlier attempt of the same
    /// build, so credentials and loaded vars survive a restart.
    async fn build_step(&self, build: Arc<dyn Build>, vars: Option<Arc<BuildVariables>>) -> ExecResult<BuiltStep>;
}

/// The production [`StepBuilder`]
pub struct Builder {
    worker: Arc<dyn WorkerClient>,
    configs: Arc<dyn ResourceConfigFactory>,
    caches: Arc<dyn ResourceCacheFactory>,
    catalog: Arc<dyn ResourceCatalog>,
    events: Arc<dyn BuildEventStore>,
    secrets: Arc<dyn Secrets>,
    limiter: Arc<CheckRateLimiter>,
    check_config: CheckConfig,
    redact: bool,
}

impl Builder {
    /// Creates a builder
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker: Arc<dyn WorkerClient>,
        configs: Arc<dyn ResourceConfigFactory>,
        caches: Arc<dyn ResourceCacheFactory>,
        catalog: Arc<dyn ResourceCatalog>,
        events: Arc<dyn BuildEventStore>,
        secrets: Arc<dyn Secrets>,
        limiter: Arc<CheckRateLimiter>,
        check_config: CheckConfig,
        redact: bool,
    ) -> Self {
        Self {
            worker,
            configs,
            caches,
            catalog,
            events,
            secrets,
            limiter,
            check_config,
            redact,
        }
    }
}

#[async_trait]
impl StepBuilder for Builder {
    async fn build_step(&self, build: Arc<dyn Build>, vars: Option<Arc<BuildVariables>>) -> ExecResult<BuiltStep> {
        let plan = build.plan().await?;
        let vars = vars.unwrap_or_else(|| Arc::new(BuildVariables::new(Arc::clone(&self.secrets), self.redact)));

        let delegates = BuildDelegateFactory::new(
            Arc::clone(&build),
            Arc::clone(&self.events),
            Arc::clone(vars.tracker()),
            Arc::clone(&self.catalog),
            Arc::clone(&self.limiter),
            self.check_config.clone(),
        );
        let factory = Arc::new(StepFactory::new(
            Arc::new(delegates),
            Arc::clone(&self.worker),
            Arc::clone(&self.configs),
            Arc::clone(&self.caches),
            Arc::clone(&self.catalog),
            build.metadata().clone(),
            self.check_config.clone(),
        ));

        tracing::debug!(build = build.id(), plan = %plan.id, "built step tree");
        Ok(BuiltStep {
            plan_id: plan.id.clone(),
            step: factory.build(&plan),
            runner: factory,
            vars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, VolumeArtifact};
    use crate::limiter::LimiterConfig;
    use crate::steps::testing::{metadata, version, FakeWorker, WorkerCall};
    use crate::vars::StaticSecrets;
    use crate::worker::WorkerError;
    use crate::ExecErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stepwise_core::db::memory::{
        InMemoryBuildStore, InMemoryCatalog, InMemoryLockFactory, InMemoryResourceCacheFactory,
        InMemoryResourceConfigFactory,
    };
    use stepwise_core::db::BuildStore;
    use stepwise_core::plan::{
        AcrossPlan, AcrossVar, CheckPlan, HookPlan, LoadVarPlan, PlanFactory, PutPlan, TaskPlan, TimeoutPlan,
        VarScopedPlan,
    };
    use stepwise_core::resource::{ResourceType, VersionedResourceType, VersionedResourceTypes};
    use stepwise_core::task::{TaskConfig, TaskRunConfig};
    use stepwise_events::{BuildEvent, InMemoryEventStore};

    /// In-memory stores and a fake worker behind a [`Builder`]
    pub(crate) struct Harness {
        pub(crate) worker: Arc<FakeWorker>,
        pub(crate) events: Arc<InMemoryEventStore>,
        pub(crate) builds: InMemoryBuildStore,
        pub(crate) builder: Arc<Builder>,
    }

    impl Harness {
        pub(crate) fn new(worker: FakeWorker) -> Self {
            let locks = InMemoryLockFactory::new();
            let configs = Arc::new(InMemoryResourceConfigFactory::new(locks.clone()));
            let catalog = Arc::new(InMemoryCatalog::new(configs.clone()));
            let worker = Arc::new(worker);
            let events = Arc::new(InMemoryEventStore::new());
            let limiter = Arc::new(CheckRateLimiter::new(
                &LimiterConfig {
                    max_checks_per_second: -1.0,
                    ..LimiterConfig::default()
                },
                configs.clone(),
            ));
            let builder = Arc::new(Builder::new(
                Arc::clone(&worker) as Arc<dyn WorkerClient>,
                configs,
                Arc::new(InMemoryResourceCacheFactory::new()),
                catalog,
                events.clone(),
                Arc::new(StaticSecrets::new().with("token", "s3cret")),
                limiter,
                CheckConfig::default(),
                true,
            ));
            Self {
                worker,
                events,
                builds: InMemoryBuildStore::new(locks),
                builder,
            }
        }

        pub(crate) async fn build(&self, kind: PlanKind) -> Arc<dyn Build> {
            let plan = PlanFactory::new(0).new_plan(kind);
            self.builds.create_build(metadata(), plan).await.unwrap()
        }
    }

    fn plans() -> PlanFactory {
        PlanFactory::new(100)
    }

    fn load_var(name: &str) -> PlanKind {
        PlanKind::LoadVar(LoadVarPlan {
            name: name.into(),
            file: format!("repo/{name}"),
            ..LoadVarPlan::default()
        })
    }

    fn task(args: &[&str]) -> PlanKind {
        PlanKind::Task(TaskPlan {
            name: "echo".into(),
            config: Some(TaskConfig {
                platform: Some("linux".into()),
                run: TaskRunConfig {
                    path: "echo".into(),
                    args: args.iter().map(|arg| (*arg).to_string()).collect(),
                    ..TaskRunConfig::default()
                },
                ..TaskConfig::default()
            }),
            ..TaskPlan::default()
        })
    }

    async fn run(harness: &Harness, kind: PlanKind) -> (ExecResult<bool>, Arc<RunState>) {
        let build = harness.build(kind).await;
        let built = harness.builder.build_step(build, None).await.unwrap();
        let state = Arc::new(RunState::new(built.vars, Some(built.runner)));
        state
            .artifacts()
            .register_artifact("repo", Arc::new(VolumeArtifact::new("vol-repo")));
        let result = built.step.run(StepContext::background(), state.clone()).await;
        (result, state)
    }

    #[tokio::test]
    async fn builds_nested_combinators() {
        let harness = Harness::new(
            FakeWorker::default()
                .with_file("first", "1")
                .with_file("second", "2"),
        );
        let plans = plans();
        let kind = PlanKind::Ensure(HookPlan::new(
            plans.new_plan(PlanKind::Do(vec![plans.new_plan(load_var("first"))])),
            plans.new_plan(load_var("second")),
        ));

        let (result, state) = run(&harness, kind).await;

        assert!(result.unwrap());
        assert_eq!(state.vars().local("first"), Some(json!("1")));
        assert_eq!(state.vars().local("second"), Some(json!("2")));
        let finished = harness
            .events
            .build_events(1)
            .iter()
            .filter(|event| matches!(event, BuildEvent::Finish { succeeded: true, .. }))
            .count();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn across_binds_each_value_for_its_step() {
        let harness = Harness::new(FakeWorker::default());
        let plans = plans();
        let values = vec![json!("x"), json!("y")];
        let kind = PlanKind::Across(AcrossPlan {
            vars: vec![AcrossVar {
                var: "v".into(),
                values: values.clone(),
                max_in_flight: 1,
            }],
            steps: values
                .into_iter()
                .map(|value| VarScopedPlan {
                    step: plans.new_plan(task(&["((.:v))", "((token))"])),
                    values: vec![value],
                })
                .collect(),
            fail_fast: false,
        });

        let (result, _) = run(&harness, kind).await;

        assert!(result.unwrap());
        let mut args: Vec<Vec<String>> = harness
            .worker
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                WorkerCall::Task(_, _, process) => Some(process.args),
                _ => None,
            })
            .collect();
        args.sort();
        assert_eq!(args, vec![vec!["x", "s3cret"], vec!["y", "s3cret"]]);
    }

    #[tokio::test]
    async fn invalid_timeouts_surface_when_run() {
        let harness = Harness::new(FakeWorker::default());
        let plans = plans();
        let kind = PlanKind::Timeout(TimeoutPlan {
            duration: "forever".into(),
            step: Box::new(plans.new_plan(task(&[]))),
        });

        let (result, _) = run(&harness, kind).await;

        assert!(matches!(result.unwrap_err().kind(), ExecErrorKind::InvalidDuration { .. }));
        assert!(harness.worker.calls().is_empty());
    }

    fn custom_types() -> VersionedResourceTypes {
        VersionedResourceTypes(vec![VersionedResourceType::new(
            ResourceType::new("custom", "registry-image"),
            Some(version("1")),
        )])
    }

    #[tokio::test]
    async fn failing_check_on_a_custom_type_fails_after_its_image_is_fetched() {
        let harness = Harness::new(FakeWorker::default());
        harness
            .worker
            .check_results
            .lock()
            .push_back(Err(WorkerError::ScriptFailed {
                script: "check".into(),
                exit_status: 1,
                stderr: "boom".into(),
            }));
        let types = custom_types();
        let (plan, _) = types.with_image("custom", &plans(), |image| {
            PlanKind::Check(CheckPlan {
                name: "image".into(),
                type_name: "custom".into(),
                image_artifact_name: image,
                resource_types: types.clone(),
                ..CheckPlan::default()
            })
        });

        let (result, _) = run(&harness, plan.kind).await;

        assert!(!result.unwrap());
        let calls = harness.worker.calls();
        let [WorkerCall::Get(image, _), WorkerCall::Check(_)] = calls.as_slice() else {
            panic!("expected image get then check, got {calls:?}");
        };
        assert_eq!(image.type_name, "registry-image");
    }

    #[tokio::test]
    async fn custom_type_images_are_not_put_inputs() {
        let harness = Harness::new(FakeWorker::default());
        let types = custom_types();
        let (plan, _) = types.with_image("custom", &plans(), |image| {
            PlanKind::Put(PutPlan {
                name: "image".into(),
                type_name: "custom".into(),
                image_artifact_name: image,
                resource_types: types.clone(),
                ..PutPlan::default()
            })
        });

        let (result, state) = run(&harness, plan.kind).await;

        assert!(result.unwrap());
        let calls = harness.worker.calls();
        let Some(WorkerCall::Put(_, container)) = calls.last() else {
            panic!("expected a put, got {calls:?}");
        };
        let inputs: Vec<&str> = container.inputs.iter().map(|input| input.name.as_str()).collect();
        assert_eq!(inputs, vec!["repo"]);
        assert_eq!(
            container.image.artifact.as_ref().map(|artifact| artifact.id().starts_with("cache-")),
            Some(true)
        );
        assert_eq!(state.artifacts().as_map().keys().collect::<Vec<_>>(), vec!["repo"]);
    }

    #[tokio::test]
    async fn runner_runs_plans_built_on_demand() {
        let harness = Harness::new(FakeWorker::default().with_file("late", "value"));
        let build = harness.build(PlanKind::Do(Vec::new())).await;
        let built = harness.builder.build_step(build, None).await.unwrap();
        let state = Arc::new(RunState::new(built.vars, Some(built.runner)));
        state
            .artifacts()
            .register_artifact("repo", Arc::new(VolumeArtifact::new("vol-repo")));

        let plan = plans().new_plan(load_var("late"));
        assert!(state.run(StepContext::background(), &plan).await.unwrap());
        assert_eq!(state.vars().local("late"), Some(json!("value")));
    }

    #[tokio::test]
    async fn reuses_the_variables_of_an_earlier_attempt() {
        let harness = Harness::new(FakeWorker::default());
        let vars = Arc::new(BuildVariables::new(Arc::new(StaticSecrets::new()), false));
        vars.set_local("kept", json!(true), false);

        let build = harness.build(PlanKind::Do(Vec::new())).await;
        let built = harness.builder.build_step(build, Some(vars.clone())).await.unwrap();

        assert!(Arc::ptr_eq(&built.vars, &vars));
    }
}
