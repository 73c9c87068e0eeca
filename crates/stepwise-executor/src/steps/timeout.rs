use async_trait::async_trait;
use std::sync::Arc;

use stepwise_core::duration::parse_duration;

use super::Outcome;
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::{ExecErrorKind, ExecResult};

/// Runs a step with a deadline; passing the deadline is a failure
pub struct TimeoutStep {
    duration: String,
    step: StepRef,
    outcome: Outcome,
}

impl TimeoutStep {
    /// Wraps `step` with a Go-style duration such as `1h30m`
    pub fn new(duration: impl Into<String>, step: StepRef) -> Self {
        Self {
            duration: duration.into(),
            step,
            outcome: Outcome::default(),
        }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        self.outcome.set(false);
        let timeout = parse_duration(&self.duration).map_err(|source| ExecErrorKind::InvalidDuration {
            value: self.duration.clone(),
            source,
        })?;

        let result = match self.step.run(ctx.with_timeout(timeout), state).await {
            Err(err) if err.is_deadline_exceeded() && ctx.err().is_none() => {
                tracing::info!(timeout = %self.duration, "step timed out");
                Ok(false)
            }
            other => other,
        };
        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
