use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;

use stepwise_core::plan::AcrossVar;

use super::parallel::InParallelStep;
use super::{flush, Outcome};
use crate::context::StepContext;
use crate::delegate::BuildStepDelegate;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::ExecResult;

const EXPERIMENTAL_WARNING: &str = "\x1b[1;33mWARNING: the across step is experimental and subject to change!\x1b[0m\n";

/// Runs a step with loop variables bound in a local scope
pub struct ScopedStep {
    bindings: Vec<(String, Value)>,
    step: StepRef,
}

impl ScopedStep {
    /// Binds `values` to `vars` pairwise around `step`
    pub fn new(vars: &[AcrossVar], values: &[Value], step: StepRef) -> Self {
        Self {
            bindings: vars
                .iter()
                .map(|var| var.var.clone())
                .zip(values.iter().cloned())
                .collect(),
            step,
        }
    }
}

#[async_trait]
impl Step for ScopedStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let local = state.new_local_scope();
        for (name, value) in &self.bindings {
            local.vars().set_local(name.clone(), value.clone(), false);
        }
        self.step.run(ctx, local).await
    }

    fn succeeded(&self) -> bool {
        self.step.succeeded()
    }
}

/// Runs one step per combination of loop values.
///
/// Combinations are nested one parallel level per variable, so each
/// variable's `max_in_flight` bounds how many of its values run at once.
pub struct AcrossStep {
    vars: Vec<AcrossVar>,
    root: StepRef,
    delegate: Arc<dyn BuildStepDelegate>,
    outcome: Outcome,
}

impl AcrossStep {
    /// Creates an across step over `steps`, given in product order
    pub fn new(
        vars: Vec<AcrossVar>,
        steps: Vec<StepRef>,
        fail_fast: bool,
        delegate: Arc<dyn BuildStepDelegate>,
    ) -> Self {
        let root = nest(&vars, steps, fail_fast);
        Self {
            vars,
            root,
            delegate,
            outcome: Outcome::default(),
        }
    }

    fn warn(&self, state: &RunState) {
        let mut stderr = self.delegate.stderr();
        let mut lines = vec![EXPERIMENTAL_WARNING.to_string()];
        for var in &self.vars {
            if state.vars().local(&var.var).is_some() {
                lines.push(format!("WARNING: across step shadows local var '{}'\n", var.var));
            }
        }
        for line in lines {
            if let Err(err) = stderr.write_all(line.as_bytes()) {
                tracing::warn!(error = %err, "failed to write across warning");
            }
        }
        flush(&mut [stderr]);
    }
}

fn nest(vars: &[AcrossVar], steps: Vec<StepRef>, fail_fast: bool) -> StepRef {
    let Some((var, rest)) = vars.split_first() else {
        return Arc::new(InParallelStep::new(steps, 0, fail_fast));
    };
    let children = if rest.is_empty() {
        steps
    } else {
        let chunk = (steps.len() / var.values.len().max(1)).max(1);
        steps
            .chunks(chunk)
            .map(|chunk| nest(rest, chunk.to_vec(), fail_fast))
            .collect()
    };
    Arc::new(InParallelStep::new(children, var.max_in_flight, fail_fast))
}

#[async_trait]
impl Step for AcrossStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();
        self.warn(&state);
        self.delegate.starting();

        let result = self.root.run(ctx, state).await;
        self.outcome.record(&result);
        let succeeded = result?;
        self.delegate.finished(succeeded);
        Ok(succeeded)
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
