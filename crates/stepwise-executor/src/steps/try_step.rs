use async_trait::async_trait;
use std::sync::Arc;

use super::Outcome;
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::ExecResult;

/// Runs a step and succeeds whatever it did, unless it was cancelled
pub struct TryStep {
    step: StepRef,
    outcome: Outcome,
}

impl TryStep {
    /// Wraps `step`
    pub fn new(step: StepRef) -> Self {
        Self {
            step,
            outcome: Outcome::default(),
        }
    }
}

#[async_trait]
impl Step for TryStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        match self.step.run(ctx, state).await {
            Err(err) if err.is_cancelled() => {
                self.outcome.set(false);
                Err(err)
            }
            Err(err) => {
                tracing::debug!(error = %err, "try suppressed error");
                self.outcome.set(true);
                Ok(true)
            }
            Ok(_) => {
                self.outcome.set(true);
                Ok(true)
            }
        }
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
