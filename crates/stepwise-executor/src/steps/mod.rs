//! One [`Step`](crate::Step) per plan variant.
//!
//! Combinators (`do`, `in_parallel`, `across`, `try`, `timeout`, `retry` and
//! the hooks) only decide which children run and how their outcomes
//! combine. Leaf steps resolve variables, report through their delegate and
//! hand the actual work to the worker client.

mod across;
mod check;
mod get;
mod hooks;
mod load_var;
mod parallel;
mod put;
mod retry;
mod sequence;
mod set_pipeline;
mod task;
mod timeout;
mod try_step;

pub use across::{AcrossStep, ScopedStep};
pub use check::CheckStep;
pub use get::GetStep;
pub use hooks::{HookStep, HookTrigger};
pub use load_var::LoadVarStep;
pub use parallel::{AggregateStep, InParallelStep};
pub use put::PutStep;
pub use retry::RetryStep;
pub use sequence::DoStep;
pub use set_pipeline::SetPipelineStep;
pub use task::TaskStep;
pub use timeout::TimeoutStep;
pub use try_step::TryStep;

use std::any::Any;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use stepwise_core::build::BuildMetadata;
use stepwise_core::plan::PlanId;

use crate::artifact::ArtifactHandle;
use crate::context::StepContext;
use crate::delegate::{BuildStepDelegate, OutputStream};
use crate::run_state::RunState;
use crate::worker::{ContainerOwner, ImageSpec, WorkerClient};
use crate::{ExecErrorKind, ExecResult};

/// Remembers whether the last run succeeded
#[derive(Debug, Default)]
pub(crate) struct Outcome(AtomicBool);

impl Outcome {
    pub(crate) fn record(&self, result: &ExecResult<bool>) {
        self.0.store(matches!(result, Ok(true)), Ordering::SeqCst);
    }

    pub(crate) fn set(&self, succeeded: bool) {
        self.0.store(succeeded, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reads `<artifact>/<path>` through the worker
pub(crate) async fn read_file(
    ctx: &StepContext,
    worker: &dyn WorkerClient,
    state: &RunState,
    file: &str,
) -> ExecResult<Vec<u8>> {
    let (name, path) = file
        .split_once('/')
        .filter(|(name, path)| !name.is_empty() && !path.is_empty())
        .ok_or_else(|| ExecErrorKind::InvalidFilePath {
            path: file.to_string(),
        })?;
    let artifact = artifact(state, name)?;
    let bytes = ctx.run(worker.stream_file(ctx, artifact.as_ref(), path)).await??;
    Ok(bytes)
}

/// Looks up an artifact, failing when it is not registered
pub(crate) fn artifact(state: &RunState, name: &str) -> ExecResult<ArtifactHandle> {
    state.artifacts().artifact_for(name).ok_or_else(|| {
        ExecErrorKind::ArtifactNotFound {
            name: name.to_string(),
        }
        .into()
    })
}

/// The image a resource step runs on; custom type images are read from the
/// scope's image table
pub(crate) fn resource_image(state: &RunState, type_name: &str, image_artifact: Option<&str>) -> ExecResult<ImageSpec> {
    let Some(name) = image_artifact else {
        return Ok(ImageSpec::for_resource_type(type_name));
    };
    let image = state.images().artifact_for(name).ok_or_else(|| ExecErrorKind::ArtifactNotFound {
        name: name.to_string(),
    })?;
    Ok(ImageSpec::from_artifact(image))
}

pub(crate) fn owner(metadata: &BuildMetadata, plan_id: &PlanId) -> ContainerOwner {
    ContainerOwner {
        build_id: metadata.build_id,
        plan_id: plan_id.clone(),
        team_id: metadata.team_id,
    }
}

/// Reports a leaf step's error to its delegate; cancellations stay silent
pub(crate) fn report_error(delegate: &dyn BuildStepDelegate, result: &ExecResult<bool>) {
    if let Err(err) = result {
        if !err.is_cancelled() {
            delegate.errored(&err.to_string());
        }
    }
}

/// Flushes buffered partial lines of a step's streams
pub(crate) fn flush(streams: &mut [OutputStream]) {
    for stream in streams {
        if let Err(err) = stream.flush() {
            tracing::warn!(error = %err, "failed to flush step output");
        }
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by step tests.

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use stepwise_core::build::BuildMetadata;
    use stepwise_core::db::memory::{InMemoryCatalog, InMemoryLockFactory, InMemoryResourceConfigFactory};
    use stepwise_core::db::ResourceCache;
    use stepwise_core::plan::PlanId;
    use stepwise_core::resource::Version;
    use stepwise_events::{BuildEventStore, InMemoryEventStore};

    use crate::artifact::{Artifact, VolumeArtifact};
    use crate::context::StepContext;
    use crate::delegate::{BuildStepDelegate, EventDelegate};
    use crate::run_state::RunState;
    use crate::step::{Step, StepRef};
    use crate::vars::{BuildVariables, RedactionTracker, StaticSecrets};
    use crate::worker::{
        CheckResult, ContainerOwner, ContainerSpec, GetResult, ProcessSpec, PutResult, ResourceRequest,
        ScriptOutput, TaskResult, WorkerClient, WorkerError, WorkerSpec,
    };
    use crate::{ExecError, ExecResult};

    use super::Outcome;

    pub(crate) fn state() -> Arc<RunState> {
        Arc::new(RunState::new(
            Arc::new(BuildVariables::new(Arc::new(StaticSecrets::new()), true)),
            None,
        ))
    }

    /// What a fake step does when run
    #[derive(Debug, Clone)]
    pub(crate) enum Behavior {
        Succeed,
        Fail,
        Error,
        Panic,
        /// Sleeps, observing cancellation
        Sleep(Duration),
        /// Waits until cancelled
        Hang,
    }

    /// A step with scripted behavior that counts its runs
    pub(crate) struct FakeStep {
        behavior: Behavior,
        runs: AtomicUsize,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        outcome: Outcome,
    }

    impl FakeStep {
        pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
            Self::tracked(behavior, Arc::default(), Arc::default())
        }

        /// A step that records how many fakes sharing `running` run at once
        pub(crate) fn tracked(behavior: Behavior, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                runs: AtomicUsize::new(0),
                running,
                peak,
                outcome: Outcome::default(),
            })
        }

        pub(crate) fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        pub(crate) fn as_step(self: &Arc<Self>) -> StepRef {
            Arc::clone(self) as StepRef
        }
    }

    #[async_trait]
    impl Step for FakeStep {
        async fn run(&self, ctx: StepContext, _state: Arc<RunState>) -> ExecResult<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = match &self.behavior {
                Behavior::Succeed => Ok(true),
                Behavior::Fail => Ok(false),
                Behavior::Error => Err(ExecError::panic("fake", "scripted error")),
                Behavior::Panic => panic!("scripted panic"),
                Behavior::Sleep(duration) => ctx.sleep(*duration).await.map(|()| true),
                Behavior::Hang => Err(ctx.run(std::future::pending::<()>()).await.unwrap_err()),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.outcome.record(&result);
            result
        }

        fn succeeded(&self) -> bool {
            self.outcome.get()
        }
    }

    /// Calls made to the fake worker
    #[derive(Debug, Clone)]
    pub(crate) enum WorkerCall {
        Check(ResourceRequest),
        Get(ResourceRequest, ContainerSpec),
        Put(ResourceRequest, ContainerSpec),
        Task(ContainerSpec, WorkerSpec, ProcessSpec),
    }

    /// A worker client returning scripted results
    #[derive(Default)]
    pub(crate) struct FakeWorker {
        pub(crate) calls: Mutex<Vec<WorkerCall>>,
        pub(crate) check_results: Mutex<VecDeque<Result<CheckResult, WorkerError>>>,
        pub(crate) get_exit_status: i32,
        pub(crate) put_result: Mutex<Option<PutResult>>,
        pub(crate) task_exit_status: i32,
        pub(crate) task_stdout: String,
        pub(crate) files: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl FakeWorker {
        pub(crate) fn with_file(self, path: &str, content: &str) -> Self {
            self.files.lock().insert(path.to_string(), content.as_bytes().to_vec());
            self
        }

        pub(crate) fn calls(&self) -> Vec<WorkerCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WorkerClient for FakeWorker {
        async fn run_check_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            _container: ContainerSpec,
            _worker: WorkerSpec,
            request: ResourceRequest,
            _output: ScriptOutput,
            _delegate: &dyn BuildStepDelegate,
            _timeout: Duration,
        ) -> Result<CheckResult, WorkerError> {
            self.calls.lock().push(WorkerCall::Check(request));
            self.check_results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(CheckResult::default()))
        }

        async fn run_get_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            container: ContainerSpec,
            _worker: WorkerSpec,
            request: ResourceRequest,
            cache: &ResourceCache,
            _output: ScriptOutput,
            _delegate: &dyn BuildStepDelegate,
        ) -> Result<GetResult, WorkerError> {
            let version = request.version.clone().unwrap_or_default();
            self.calls.lock().push(WorkerCall::Get(request, container));
            let artifact: Option<Arc<dyn Artifact>> = (self.get_exit_status == 0)
                .then(|| Arc::new(VolumeArtifact::new(format!("cache-{}", cache.id))) as Arc<dyn Artifact>);
            Ok(GetResult {
                exit_status: self.get_exit_status,
                version_result: stepwise_core::resource::VersionResult::new(version),
                artifact,
            })
        }

        async fn run_put_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            container: ContainerSpec,
            _worker: WorkerSpec,
            request: ResourceRequest,
            _output: ScriptOutput,
            _delegate: &dyn BuildStepDelegate,
        ) -> Result<PutResult, WorkerError> {
            self.calls.lock().push(WorkerCall::Put(request, container));
            Ok(self.put_result.lock().clone().unwrap_or_default())
        }

        async fn run_task_step(
            &self,
            _ctx: &StepContext,
            _owner: ContainerOwner,
            container: ContainerSpec,
            worker: WorkerSpec,
            mut process: ProcessSpec,
            _delegate: &dyn BuildStepDelegate,
        ) -> Result<TaskResult, WorkerError> {
            use std::io::Write;
            if !self.task_stdout.is_empty() {
                let _ = process.stdout.write_all(self.task_stdout.as_bytes());
            }
            let outputs = container
                .outputs
                .keys()
                .map(|name| {
                    (
                        name.clone(),
                        Arc::new(VolumeArtifact::new(format!("output-{name}"))) as Arc<dyn Artifact>,
                    )
                })
                .collect();
            self.calls.lock().push(WorkerCall::Task(container, worker, process));
            Ok(TaskResult {
                exit_status: self.task_exit_status,
                outputs,
            })
        }

        async fn stream_file(
            &self,
            _ctx: &StepContext,
            artifact: &dyn Artifact,
            path: &str,
        ) -> Result<Vec<u8>, WorkerError> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| WorkerError::FileNotFound {
                    artifact: artifact.id().to_string(),
                    path: path.to_string(),
                })
        }
    }

    pub(crate) fn events(store: &Arc<InMemoryEventStore>, plan_id: &str) -> EventDelegate {
        EventDelegate::new(
            1,
            PlanId::new(plan_id),
            Arc::clone(store) as Arc<dyn BuildEventStore>,
            Arc::new(RedactionTracker::new(false)),
        )
    }

    pub(crate) fn catalog() -> Arc<InMemoryCatalog> {
        Arc::new(InMemoryCatalog::new(Arc::new(InMemoryResourceConfigFactory::new(
            InMemoryLockFactory::new(),
        ))))
    }

    pub(crate) fn metadata() -> BuildMetadata {
        BuildMetadata {
            build_id: 1,
            build_name: "1".into(),
            team_id: 1,
            team_name: "main".into(),
            ..BuildMetadata::default()
        }
    }

    pub(crate) fn version(reference: &str) -> Version {
        Version::from([("ref".to_string(), reference.to_string())])
    }
}
