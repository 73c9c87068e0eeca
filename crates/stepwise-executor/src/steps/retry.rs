use async_trait::async_trait;
use std::sync::Arc;

use super::Outcome;
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::ExecResult;

/// Runs attempts in order until one succeeds.
///
/// A failed attempt moves on to the next; an errored one stops the retry.
pub struct RetryStep {
    attempts: Vec<StepRef>,
    outcome: Outcome,
}

impl RetryStep {
    /// Creates a retry over pre-built attempts
    pub fn new(attempts: Vec<StepRef>) -> Self {
        Self {
            attempts,
            outcome: Outcome::default(),
        }
    }
}

#[async_trait]
impl Step for RetryStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        self.outcome.set(false);
        for (attempt, step) in self.attempts.iter().enumerate() {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            if step.run(ctx.clone(), Arc::clone(&state)).await? {
                self.outcome.set(true);
                return Ok(true);
            }
            tracing::debug!(attempt = attempt + 1, total = self.attempts.len(), "attempt failed");
        }
        Ok(false)
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
