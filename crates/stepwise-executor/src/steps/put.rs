use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use stepwise_core::build::BuildMetadata;
use stepwise_core::plan::{InputsConfig, PlanId, PutPlan};
use stepwise_core::resource::Params;

use super::{artifact, flush, owner, report_error, resource_image, Outcome};
use crate::artifact::ArtifactHandle;
use crate::context::StepContext;
use crate::delegate::PutDelegate;
use crate::run_state::RunState;
use crate::step::Step;
use crate::worker::{ContainerSpec, InputSource, ResourceRequest, ScriptOutput, WorkerClient, WorkerSpec};
use crate::{ExecError, ExecResult};

/// Publishes a new resource version from the artifacts of the build
pub struct PutStep {
    plan_id: PlanId,
    plan: PutPlan,
    metadata: BuildMetadata,
    worker: Arc<dyn WorkerClient>,
    delegate: Arc<dyn PutDelegate>,
    outcome: Outcome,
}

impl PutStep {
    /// Creates a put step
    pub fn new(
        plan_id: PlanId,
        plan: PutPlan,
        metadata: BuildMetadata,
        worker: Arc<dyn WorkerClient>,
        delegate: Arc<dyn PutDelegate>,
    ) -> Self {
        Self {
            plan_id,
            plan,
            metadata,
            worker,
            delegate,
            outcome: Outcome::default(),
        }
    }

    fn inputs(&self, state: &RunState, params: &Params) -> ExecResult<Vec<InputSource>> {
        let input = |(name, artifact): (String, ArtifactHandle)| InputSource {
            path: name.clone(),
            name,
            artifact,
        };
        match self.plan.inputs.as_ref().unwrap_or(&InputsConfig::All) {
            InputsConfig::All => Ok(state.artifacts().as_map().into_iter().map(input).collect()),
            InputsConfig::Specified(names) => names
                .iter()
                .map(|name| Ok(input((name.clone(), artifact(state, name)?))))
                .collect(),
            InputsConfig::Detect => {
                let mut names = BTreeSet::new();
                for value in params.values() {
                    detect(value, &mut names);
                }
                Ok(names
                    .into_iter()
                    .filter_map(|name| {
                        let found = state.artifacts().artifact_for(&name)?;
                        Some(input((name, found)))
                    })
                    .collect())
            }
        }
    }

    async fn publish(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();

        let source = state.vars().interpolate_map(&self.plan.source)?;
        let params = state.vars().interpolate_map(&self.plan.params)?;
        let inputs = self.inputs(state, &params)?;
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
            inputs,
            ..ContainerSpec::default()
        };
        let request = ResourceRequest {
            type_name: self.plan.type_name.clone(),
            source: source.clone(),
            params,
            version: None,
            resource_types: self.plan.resource_types.clone(),
        };
        let mut streams = [self.delegate.stdout(), self.delegate.stderr()];
        let output = ScriptOutput {
            stdout: streams[0].clone(),
            stderr: streams[1].clone(),
        };

        self.delegate.starting();
        let result = ctx
            .run(self.worker.run_put_step(
                ctx,
                owner(&self.metadata, &self.plan_id),
                container,
                worker_spec,
                request,
                output,
                self.delegate.as_ref(),
            ))
            .await?
            .map_err(|err| ExecError::from(err).in_step(format!("put {}", self.plan.name)));
        flush(&mut streams);
        let result = result?;

        let succeeded = result.exit_status == 0;
        if succeeded {
            if let Some(resource) = &self.plan.resource {
                self.delegate
                    .save_output(resource, &source, &self.plan.resource_types, &result.version_result)
                    .await?;
            }
            state.store_result(&self.plan_id, &result.version_result)?;
        }

        self.delegate.finished_put(result.exit_status, &result.version_result);
        Ok(succeeded)
    }
}

/// Collects the leading path segment of every string inside `value`
fn detect(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(path) => {
            if let Some(name) = path.split('/').next().filter(|name| !name.is_empty()) {
                names.insert(name.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|item| detect(item, names)),
        Value::Object(fields) => fields.values().for_each(|field| detect(field, names)),
        _ => {}
    }
}

#[async_trait]
impl Step for PutStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = self.publish(&ctx, &state).await;
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
    use crate::worker::PutResult;
    use crate::ExecErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stepwise_core::db::memory::InMemoryCatalog;
    use stepwise_core::db::{Checkable, CheckableKind, ResourceCatalog};
    use stepwise_core::pipeline::PipelineConfig;
    use stepwise_core::resource::{Resource, VersionResult};
    use stepwise_events::{BuildEvent, InMemoryEventStore};

    fn put_step(
        plan: PutPlan,
        worker: &Arc<FakeWorker>,
        store: &Arc<InMemoryEventStore>,
        catalog: Arc<InMemoryCatalog>,
        pipeline_id: Option<u64>,
    ) -> PutStep {
        PutStep::new(
            PlanId::new("3"),
            plan,
            metadata(),
            Arc::clone(worker) as Arc<dyn WorkerClient>,
            Arc::new(ResourceDelegate::new(events(store, "3"), catalog, pipeline_id)),
        )
    }

    fn plan(inputs: Option<InputsConfig>) -> PutPlan {
        PutPlan {
            name: "image".into(),
            type_name: "registry-image".into(),
            inputs,
            ..PutPlan::default()
        }
    }

    fn worker() -> Arc<FakeWorker> {
        let worker = FakeWorker::default();
        *worker.put_result.lock() = Some(PutResult {
            exit_status: 0,
            version_result: VersionResult::new(version("v1")),
        });
        Arc::new(worker)
    }

    fn state_with(names: &[&str]) -> Arc<RunState> {
        let state = state();
        for name in names {
            state
                .artifacts()
                .register_artifact(*name, Arc::new(VolumeArtifact::new(format!("vol-{name}"))));
        }
        state
    }

    fn input_names(worker: &FakeWorker) -> Vec<String> {
        let calls = worker.calls();
        let [WorkerCall::Put(_, container)] = calls.as_slice() else {
            panic!("expected one put, got {calls:?}");
        };
        container.inputs.iter().map(|input| input.name.clone()).collect()
    }

    #[tokio::test]
    async fn hands_every_artifact_by_default_and_stores_the_version() {
        let worker = worker();
        let store = Arc::new(InMemoryEventStore::new());
        let state = state_with(&["repo", "build"]);

        assert!(put_step(plan(None), &worker, &store, catalog(), None)
            .run(StepContext::background(), state.clone())
            .await
            .unwrap());

        assert_eq!(input_names(&worker), vec!["build", "repo"]);
        assert_eq!(
            state.result::<VersionResult>(&PlanId::new("3")),
            Some(VersionResult::new(version("v1")))
        );
        assert!(store.build_events(1).iter().any(|event| matches!(
            event,
            BuildEvent::FinishPut { exit_status: 0, .. }
        )));
    }

    #[tokio::test]
    async fn specified_inputs_must_exist() {
        let worker = worker();
        let store = Arc::new(InMemoryEventStore::new());
        let state = state_with(&["repo"]);
        let plan = plan(Some(InputsConfig::Specified(vec!["repo".into(), "missing".into()])));

        let err = put_step(plan, &worker, &store, catalog(), None)
            .run(StepContext::background(), state)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ExecErrorKind::ArtifactNotFound { name } if name == "missing"));
        assert!(worker.calls().is_empty());
    }

    #[tokio::test]
    async fn detects_inputs_from_param_paths() {
        let worker = worker();
        let store = Arc::new(InMemoryEventStore::new());
        let state = state_with(&["repo", "build", "unused"]);
        let plan = PutPlan {
            params: json!({
                "image": "build/image.tar",
                "extra": {"tags": ["repo/tags", "nowhere/file"]},
                "count": 3
            })
            .as_object()
            .cloned()
            .unwrap(),
            ..plan(Some(InputsConfig::Detect))
        };

        put_step(plan, &worker, &store, catalog(), None)
            .run(StepContext::background(), state)
            .await
            .unwrap();

        assert_eq!(input_names(&worker), vec!["build", "repo"]);
    }

    #[tokio::test]
    async fn saves_the_output_on_the_catalog_resource() {
        let worker = worker();
        let store = Arc::new(InMemoryEventStore::new());
        let catalog = catalog();
        let pipeline_id = catalog.add_pipeline(
            "main",
            "ci",
            PipelineConfig {
                resources: vec![Resource::new("image", "registry-image")],
                ..PipelineConfig::default()
            },
        );
        let plan = PutPlan {
            resource: Some("image".into()),
            ..plan(Some(InputsConfig::Specified(Vec::new())))
        };

        assert!(put_step(plan, &worker, &store, catalog.clone(), Some(pipeline_id))
            .run(StepContext::background(), state())
            .await
            .unwrap());

        let checkable = catalog
            .find_checkable(pipeline_id, CheckableKind::Resource, "image")
            .await
            .unwrap()
            .unwrap();
        assert!(checkable.resource_config_scope_id().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_script_stores_nothing() {
        let worker = FakeWorker::default();
        *worker.put_result.lock() = Some(PutResult {
            exit_status: 2,
            version_result: VersionResult::default(),
        });
        let worker = Arc::new(worker);
        let store = Arc::new(InMemoryEventStore::new());
        let state = state();

        assert!(!put_step(plan(None), &worker, &store, catalog(), None)
            .run(StepContext::background(), state.clone())
            .await
            .unwrap());
        assert_eq!(state.result::<VersionResult>(&PlanId::new("3")), None);
    }
}
