use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::Outcome;
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::{ExecResult, MultiError};

/// When a hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTrigger {
    /// The primary step succeeded
    OnSuccess,
    /// The primary step completed without succeeding
    OnFailure,
    /// The primary step was cancelled
    OnAbort,
    /// The primary step errored for any other reason
    OnError,
    /// Always
    Ensure,
}

impl HookTrigger {
    fn fires(self, primary: &ExecResult<bool>) -> bool {
        match (self, primary) {
            (Self::OnSuccess, Ok(true)) | (Self::OnFailure, Ok(false)) | (Self::Ensure, _) => true,
            (Self::OnAbort, Err(err)) => err.is_cancelled(),
            (Self::OnError, Err(err)) => !err.is_cancelled(),
            _ => false,
        }
    }
}

impl fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
            Self::OnAbort => "on_abort",
            Self::OnError => "on_error",
            Self::Ensure => "ensure",
        };
        f.write_str(name)
    }
}

/// Runs a primary step, then a hook depending on how the primary ended.
///
/// The outcome is the primary's; an error raised by the hook propagates.
pub struct HookStep {
    trigger: HookTrigger,
    step: StepRef,
    hook: StepRef,
    outcome: Outcome,
}

impl HookStep {
    /// Pairs `step` with `hook`
    pub fn new(trigger: HookTrigger, step: StepRef, hook: StepRef) -> Self {
        Self {
            trigger,
            step,
            hook,
            outcome: Outcome::default(),
        }
    }

    fn hook_context(&self, ctx: &StepContext, primary: &ExecResult<bool>) -> StepContext {
        let cancelled = ctx.token().is_cancelled() || primary.as_ref().is_err_and(|err| err.is_cancelled());
        match self.trigger {
            HookTrigger::OnAbort => ctx.detached(),
            HookTrigger::Ensure if cancelled => ctx.detached(),
            _ => ctx.clone(),
        }
    }
}

#[async_trait]
impl Step for HookStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let primary = self.step.run(ctx.clone(), Arc::clone(&state)).await;

        let result = if self.trigger.fires(&primary) {
            tracing::debug!(trigger = %self.trigger, "running hook");
            let hook_ctx = self.hook_context(&ctx, &primary);
            match (primary, self.hook.run(hook_ctx, state).await) {
                (primary, Ok(_)) => primary,
                (Ok(_), Err(hook_err)) => Err(hook_err),
                (Err(primary_err), Err(hook_err)) => Err([primary_err, hook_err].into_iter().collect::<MultiError>().into()),
            }
        } else {
            primary
        };

        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}
