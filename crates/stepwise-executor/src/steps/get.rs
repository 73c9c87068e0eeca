use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use stepwise_core::build::BuildMetadata;
use stepwise_core::db::{ResourceCacheFactory, ResourceCacheUser};
use stepwise_core::plan::{GetPlan, PlanId};
use stepwise_core::resource::{Version, VersionResult};

use super::{flush, owner, report_error, resource_image, Outcome};
use crate::context::StepContext;
use crate::delegate::GetDelegate;
use crate::run_state::RunState;
use crate::step::Step;
use crate::worker::{ContainerSpec, ResourceRequest, ScriptOutput, WorkerClient, WorkerSpec};
use crate::{ExecErrorKind, ExecResult};

/// Fetches a resource version and registers it as an artifact.
///
/// The version is either fixed by the plan or read from the result another
/// node stored, typically the check that precedes the get.
pub struct GetStep {
    plan_id: PlanId,
    plan: GetPlan,
    metadata: BuildMetadata,
    worker: Arc<dyn WorkerClient>,
    caches: Arc<dyn ResourceCacheFactory>,
    delegate: Arc<dyn GetDelegate>,
    outcome: Outcome,
}

impl GetStep {
    /// Creates a get step
    pub fn new(
        plan_id: PlanId,
        plan: GetPlan,
        metadata: BuildMetadata,
        worker: Arc<dyn WorkerClient>,
        caches: Arc<dyn ResourceCacheFactory>,
        delegate: Arc<dyn GetDelegate>,
    ) -> Self {
        Self {
            plan_id,
            plan,
            metadata,
            worker,
            caches,
            delegate,
            outcome: Outcome::default(),
        }
    }

    fn version(&self, state: &RunState) -> ExecResult<Version> {
        if let Some(version) = &self.plan.version {
            return Ok(version.clone());
        }
        let plan_id = self.plan.version_from.as_ref().ok_or_else(|| ExecErrorKind::VersionNotFound {
            plan_id: self.plan_id.clone(),
        })?;
        state
            .result::<VersionResult>(plan_id)
            .map(|result| result.version)
            .ok_or_else(|| {
                ExecErrorKind::VersionNotFound {
                    plan_id: plan_id.clone(),
                }
                .into()
            })
    }

    async fn fetch(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();

        let source = state.vars().interpolate_map(&self.plan.source)?;
        let params = state.vars().interpolate_map(&self.plan.params)?;
        let version = self.version(state)?;
        let image = resource_image(state, &self.plan.type_name, self.plan.image_artifact_name.as_deref())?;

        let cache = self
            .caches
            .find_or_create_resource_cache(
                ResourceCacheUser::Build(self.metadata.build_id),
                &self.plan.type_name,
                &version,
                &source,
                &params,
                &self.plan.resource_types,
            )
            .await?;

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
            params,
            version: Some(version),
            resource_types: self.plan.resource_types.clone(),
        };
        let mut streams = [self.delegate.stdout(), self.delegate.stderr()];
        let output = ScriptOutput {
            stdout: streams[0].clone(),
            stderr: streams[1].clone(),
        };

        self.delegate.starting();
        info!(step = %self.plan.name, cache = cache.id, "fetching version");
        let result = ctx
            .run(self.worker.run_get_step(
                ctx,
                owner(&self.metadata, &self.plan_id),
                container,
                worker_spec,
                request,
                &cache,
                output,
                self.delegate.as_ref(),
            ))
            .await?
            .map_err(|err| crate::ExecError::from(err).in_step(format!("get {}", self.plan.name)));
        flush(&mut streams);
        let result = result?;

        let succeeded = result.exit_status == 0;
        if succeeded {
            if let Some(artifact) = result.artifact {
                let repository = if self.plan.image {
                    state.images()
                } else {
                    state.artifacts()
                };
                repository.register_artifact(self.plan.name.clone(), artifact);
            }
            if let Some(resource) = &self.plan.resource {
                self.delegate
                    .update_resource_version(resource, &result.version_result)
                    .await?;
            }
        } else {
            debug!(step = %self.plan.name, exit_status = result.exit_status, "get failed");
        }

        self.delegate.finished_get(result.exit_status, &result.version_result);
        Ok(succeeded)
    }
}

#[async_trait]
impl Step for GetStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = self.fetch(&ctx, &state).await;
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
    use crate::artifact::VolumeArtifact;
    use crate::delegate::ResourceDelegate;
    use crate::steps::testing::{catalog, events, metadata, state, version, FakeWorker, WorkerCall};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stepwise_core::db::memory::InMemoryResourceCacheFactory;
    use stepwise_events::{BuildEvent, InMemoryEventStore};

    fn get_step(plan: GetPlan, worker: &Arc<FakeWorker>, store: &Arc<InMemoryEventStore>) -> GetStep {
        GetStep::new(
            PlanId::new("2"),
            plan,
            metadata(),
            Arc::clone(worker) as Arc<dyn WorkerClient>,
            Arc::new(InMemoryResourceCacheFactory::new()),
            Arc::new(ResourceDelegate::new(events(store, "2"), catalog(), None)),
        )
    }

    fn plan() -> GetPlan {
        GetPlan {
            name: "repo".into(),
            type_name: "git".into(),
            version: Some(version("abc")),
            ..GetPlan::default()
        }
    }

    fn event_types(store: &InMemoryEventStore) -> Vec<&'static str> {
        store.build_events(1).iter().map(BuildEvent::event_type).collect()
    }

    #[tokio::test]
    async fn fetches_the_version_and_registers_the_artifact() {
        let worker = Arc::new(FakeWorker::default());
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();

        let succeeded = get_step(plan(), &worker, &store)
            .run(StepContext::background(), state.clone())
            .await
            .unwrap();

        assert!(succeeded);
        let artifact = state.artifacts().artifact_for("repo").unwrap();
        assert!(artifact.id().starts_with("cache-"));

        let calls = worker.calls();
        let [WorkerCall::Get(request, container)] = calls.as_slice() else {
            panic!("expected one get, got {calls:?}");
        };
        assert_eq!(request.version, Some(version("abc")));
        assert_eq!(container.image.resource_type.as_deref(), Some("git"));
        assert!(container.env.contains(&"BUILD_ID=1".to_string()));
        assert_eq!(event_types(&store), vec!["initialize", "start", "finish-get"]);
    }

    #[tokio::test]
    async fn reads_the_version_from_an_earlier_result() {
        let worker = Arc::new(FakeWorker::default());
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();
        state
            .store_result(&PlanId::new("1"), &VersionResult::new(version("def")))
            .unwrap();
        let plan = GetPlan {
            version: None,
            version_from: Some(PlanId::new("1")),
            ..plan()
        };

        assert!(get_step(plan, &worker, &store)
            .run(StepContext::background(), state)
            .await
            .unwrap());
        let WorkerCall::Get(request, _) = &worker.calls()[0] else {
            panic!("expected a get");
        };
        assert_eq!(request.version, Some(version("def")));
    }

    #[tokio::test]
    async fn missing_version_is_an_error() {
        let worker = Arc::new(FakeWorker::default());
        let store = Arc::new(InMemoryEventStore::new());
        let plan = GetPlan {
            version: None,
            version_from: Some(PlanId::new("1")),
            ..plan()
        };

        let err = get_step(plan, &worker, &store)
            .run(StepContext::background(), state())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ExecErrorKind::VersionNotFound { .. }));
        assert!(worker.calls().is_empty());
        assert_eq!(event_types(&store), vec!["initialize", "error"]);
    }

    #[tokio::test]
    async fn failing_script_registers_nothing() {
        let worker = Arc::new(FakeWorker {
            get_exit_status: 1,
            ..FakeWorker::default()
        });
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();
        let step = get_step(plan(), &worker, &store);

        assert!(!step.run(StepContext::background(), state.clone()).await.unwrap());
        assert!(!step.succeeded());
        assert!(state.artifacts().artifact_for("repo").is_none());
        assert!(store.build_events(1).iter().any(|event| matches!(
            event,
            BuildEvent::FinishGet { exit_status: 1, .. }
        )));
    }

    #[tokio::test]
    async fn interpolates_source_and_uses_custom_type_images() {
        let worker = Arc::new(FakeWorker::default());
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();
        state.vars().set_local("branch", json!("main"), false);
        state
            .images()
            .register_artifact("type:custom", Arc::new(VolumeArtifact::new("custom-image")));
        let plan = GetPlan {
            type_name: "custom".into(),
            image_artifact_name: Some("type:custom".into()),
            source: json!({"branch": "((branch))"}).as_object().cloned().unwrap(),
            ..plan()
        };

        assert!(get_step(plan, &worker, &store)
            .run(StepContext::background(), state)
            .await
            .unwrap());
        let WorkerCall::Get(request, container) = &worker.calls()[0] else {
            panic!("expected a get");
        };
        assert_eq!(request.source["branch"], json!("main"));
        assert_eq!(
            container.image.artifact.as_ref().map(|a| a.id().to_string()),
            Some("custom-image".to_string())
        );
        assert_eq!(container.image.resource_type, None);
    }

    #[tokio::test]
    async fn image_fetches_register_outside_the_build_artifacts() {
        let worker = Arc::new(FakeWorker::default());
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();
        let plan = GetPlan {
            name: "type:custom".into(),
            type_name: "registry-image".into(),
            image: true,
            ..plan()
        };

        assert!(get_step(plan, &worker, &store)
            .run(StepContext::background(), state.clone())
            .await
            .unwrap());
        assert!(state.images().artifact_for("type:custom").is_some());
        assert!(state.artifacts().as_map().is_empty());
    }

    #[tokio::test]
    async fn build_artifacts_are_not_custom_type_images() {
        let worker = Arc::new(FakeWorker::default());
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();
        state
            .artifacts()
            .register_artifact("type:custom", Arc::new(VolumeArtifact::new("custom-image")));
        let plan = GetPlan {
            type_name: "custom".into(),
            image_artifact_name: Some("type:custom".into()),
            ..plan()
        };

        let err = get_step(plan, &worker, &store)
            .run(StepContext::background(), state)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ExecErrorKind::ArtifactNotFound { .. }));
        assert!(worker.calls().is_empty());
    }
}
