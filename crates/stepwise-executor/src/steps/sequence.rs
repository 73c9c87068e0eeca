use async_trait::async_trait;
use std::sync::Arc;

use super::Outcome;
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::ExecResult;

/// Runs children in order, stopping at the first that does not succeed
pub struct DoStep {
    steps: Vec<StepRef>,
    outcome: Outcome,
}

impl DoStep {
    /// Creates a sequence
    pub fn new(steps: Vec<StepRef>) -> Self {
        Self {
            steps,
            outcome: Outcome::default(),
        }
    }
}

#[async_trait]
impl Step for DoStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        self.outcome.set(false);
        for step in &self.steps {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if !step.run(ctx.clone(), Arc::clone(&state)).await? {
                return Ok(false);
            }
        }
        self.outcome.set(true);
        Ok(true)
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
