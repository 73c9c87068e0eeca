use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use stepwise_core::build::BuildMetadata;
use stepwise_core::plan::{PlanId, TaskPlan};
use stepwise_core::task::TaskConfig;

use super::{artifact, flush, owner, read_file, report_error, Outcome};
use crate::context::StepContext;
use crate::delegate::TaskDelegate;
use crate::run_state::RunState;
use crate::step::Step;
use crate::worker::{ContainerSpec, ImageSpec, InputSource, ProcessSpec, WorkerClient, WorkerSpec};
use crate::{ExecError, ExecErrorKind, ExecResult};

/// Runs a process in a container built from the task's configuration
pub struct TaskStep {
    plan_id: PlanId,
    plan: TaskPlan,
    metadata: BuildMetadata,
    worker: Arc<dyn WorkerClient>,
    delegate: Arc<dyn TaskDelegate>,
    outcome: Outcome,
}

impl TaskStep {
    /// Creates a task step
    pub fn new(
        plan_id: PlanId,
        plan: TaskPlan,
        metadata: BuildMetadata,
        worker: Arc<dyn WorkerClient>,
        delegate: Arc<dyn TaskDelegate>,
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

    /// Loads, overrides, interpolates and validates the configuration
    async fn config(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<TaskConfig> {
        let mut config = match (&self.plan.config_path, &self.plan.config) {
            (Some(path), _) => {
                let bytes = read_file(ctx, self.worker.as_ref(), state, path).await?;
                TaskConfig::from_yaml(&String::from_utf8_lossy(&bytes)).map_err(|err| ExecErrorKind::ParseFile {
                    file: path.clone(),
                    format: "yaml".to_string(),
                    reason: err.to_string(),
                })?
            }
            (None, Some(config)) => config.clone(),
            (None, None) => {
                return Err(ExecErrorKind::TaskConfig {
                    reason: "neither config nor file given".to_string(),
                }
                .into());
            }
        };
        config.override_params(&self.plan.params);

        let vars = state.vars().new_local_scope();
        for (name, value) in state.vars().interpolate_map(&self.plan.vars)? {
            vars.set_local(name, value, false);
        }
        let interpolated = vars.interpolate(&serde_json::to_value(&config)?)?;
        let config: TaskConfig = serde_json::from_value(interpolated).map_err(|err| ExecErrorKind::TaskConfig {
            reason: err.to_string(),
        })?;

        config.validate().map_err(|err| ExecErrorKind::TaskConfig {
            reason: err.problems.join(", "),
        })?;
        Ok(config)
    }

    async fn image(&self, ctx: &StepContext, state: &Arc<RunState>, config: &TaskConfig) -> ExecResult<ImageSpec> {
        let privileged = self.plan.privileged;
        if let Some(name) = &self.plan.image_artifact_name {
            return Ok(ImageSpec {
                privileged,
                ..ImageSpec::from_artifact(artifact(state, name)?)
            });
        }
        if let Some(image) = &config.image_resource {
            return self
                .delegate
                .fetch_image(ctx, image, &self.plan.resource_types, privileged, &self.plan.tags, state)
                .await;
        }
        Ok(ImageSpec {
            url: config.rootfs_uri.clone(),
            privileged,
            ..ImageSpec::default()
        })
    }

    fn inputs(&self, state: &RunState, config: &TaskConfig) -> ExecResult<Vec<InputSource>> {
        let mut inputs = Vec::with_capacity(config.inputs.len());
        for input in &config.inputs {
            let name = self.plan.input_mapping.get(&input.name).unwrap_or(&input.name);
            match state.artifacts().artifact_for(name) {
                Some(artifact) => inputs.push(InputSource {
                    name: input.name.clone(),
                    artifact,
                    path: input.path.clone().unwrap_or_else(|| input.name.clone()),
                }),
                None if input.optional => {
                    tracing::debug!(input = %input.name, "skipping missing optional input");
                }
                None => return Err(ExecErrorKind::ArtifactNotFound { name: name.clone() }.into()),
            }
        }
        Ok(inputs)
    }

    async fn execute(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();

        let config = self.config(ctx, state).await?;
        let image = self.image(ctx, state, &config).await?;
        let inputs = self.inputs(state, &config)?;
        let outputs: BTreeMap<String, String> = config
            .outputs
            .iter()
            .map(|output| {
                let path = output.path.clone().unwrap_or_else(|| output.name.clone());
                (output.name.clone(), path)
            })
            .collect();

        let mut streams = [self.delegate.stdout(), self.delegate.stderr()];
        let process = ProcessSpec {
            path: config.run.path.clone(),
            args: config.run.args.clone(),
            dir: config.run.dir.clone(),
            user: config.run.user.clone(),
            stdout: streams[0].clone(),
            stderr: streams[1].clone(),
        };
        let container = ContainerSpec {
            team_id: self.metadata.team_id,
            image,
            env: env(&config),
            inputs,
            outputs,
            ..ContainerSpec::default()
        };
        let worker_spec = WorkerSpec {
            platform: config.platform.clone(),
            tags: self.plan.tags.clone(),
            team_id: self.metadata.team_id,
            ..WorkerSpec::default()
        };

        self.delegate.starting();
        info!(step = %self.plan.name, path = %config.run.path, "running task");
        let result = ctx
            .run(self.worker.run_task_step(
                ctx,
                owner(&self.metadata, &self.plan_id),
                container,
                worker_spec,
                process,
                self.delegate.as_ref(),
            ))
            .await?
            .map_err(|err| ExecError::from(err).in_step(format!("task {}", self.plan.name)));
        flush(&mut streams);
        let result = result?;

        for (name, artifact) in result.outputs {
            let target = self.plan.output_mapping.get(&name).cloned().unwrap_or(name);
            state.artifacts().register_artifact(target, artifact);
        }

        self.delegate.finished_task(result.exit_status);
        Ok(result.exit_status == 0)
    }
}

/// Task params as sorted `KEY=value`; non-string values are JSON-encoded
fn env(config: &TaskConfig) -> Vec<String> {
    let mut env: Vec<String> = config
        .params
        .iter()
        .map(|(key, value)| match value {
            Value::String(raw) => format!("{key}={raw}"),
            Value::Null => format!("{key}="),
            other => format!("{key}={other}"),
        })
        .collect();
    env.sort();
    env
}

#[async_trait]
impl Step for TaskStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = self.execute(&ctx, &state).await;
        report_error(self.delegate.as_ref(), &result);
        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
