use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;

use stepwise_core::build::BuildMetadata;
use stepwise_core::db::ResourceCatalog;
use stepwise_core::pipeline::PipelineConfig;
use stepwise_core::plan::SetPipelinePlan;

use super::{flush, read_file, report_error, Outcome};
use crate::context::StepContext;
use crate::delegate::BuildStepDelegate;
use crate::run_state::RunState;
use crate::step::Step;
use crate::vars::interpolate_template;
use crate::worker::WorkerClient;
use crate::{ExecErrorKind, ExecResult};

/// Renders a pipeline file from an artifact and saves it to the catalog
pub struct SetPipelineStep {
    plan: SetPipelinePlan,
    metadata: BuildMetadata,
    worker: Arc<dyn WorkerClient>,
    catalog: Arc<dyn ResourceCatalog>,
    delegate: Arc<dyn BuildStepDelegate>,
    outcome: Outcome,
}

impl SetPipelineStep {
    /// Creates a set-pipeline step
    pub fn new(
        plan: SetPipelinePlan,
        metadata: BuildMetadata,
        worker: Arc<dyn WorkerClient>,
        catalog: Arc<dyn ResourceCatalog>,
        delegate: Arc<dyn BuildStepDelegate>,
    ) -> Self {
        Self {
            plan,
            metadata,
            worker,
            catalog,
            delegate,
            outcome: Outcome::default(),
        }
    }

    /// Var files in order, then the step's own vars on top
    async fn template_vars(&self, ctx: &StepContext, state: &RunState) -> ExecResult<Map<String, Value>> {
        let mut vars = Map::new();
        for file in &self.plan.var_files {
            let bytes = read_file(ctx, self.worker.as_ref(), state, file).await?;
            let parsed: Map<String, Value> = serde_yaml::from_slice(&bytes).map_err(|err| ExecErrorKind::ParseFile {
                file: file.clone(),
                format: "yaml".to_string(),
                reason: err.to_string(),
            })?;
            vars.extend(parsed);
        }
        vars.extend(state.vars().interpolate_map(&self.plan.vars)?);
        Ok(vars)
    }

    async fn set(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();

        let raw = read_file(ctx, self.worker.as_ref(), state, &self.plan.file).await?;
        let vars = self.template_vars(ctx, state).await?;
        let rendered = interpolate_template(&String::from_utf8_lossy(&raw), &vars);

        let config = PipelineConfig::from_yaml(&rendered).map_err(|err| ExecErrorKind::ParseFile {
            file: self.plan.file.clone(),
            format: "yaml".to_string(),
            reason: err.to_string(),
        })?;
        config.validate().map_err(|err| ExecErrorKind::PipelineConfig {
            reason: err.problems.join(", "),
        })?;

        let team = self.plan.team.as_deref().unwrap_or(&self.metadata.team_name);
        self.delegate.starting();
        let changed = self.catalog.save_pipeline(team, &self.plan.name, &config).await?;
        tracing::info!(team, pipeline = %self.plan.name, changed, "set pipeline");

        let mut stdout = self.delegate.stdout();
        let message = if changed {
            format!("setting pipeline: {}\n", self.plan.name)
        } else {
            "no changes to apply\n".to_string()
        };
        if let Err(err) = stdout.write_all(message.as_bytes()) {
            tracing::warn!(error = %err, "failed to write set_pipeline output");
        }
        flush(&mut [stdout]);

        self.delegate.finished(true);
        Ok(true)
    }
}

#[async_trait]
impl Step for SetPipelineStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = self.set(&ctx, &state).await;
        report_error(self.delegate.as_ref(), &result);
        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
