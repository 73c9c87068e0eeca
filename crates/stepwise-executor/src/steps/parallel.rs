use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{panic_message, Outcome};
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::step::{Step, StepRef};
use crate::{ExecError, ExecResult, MultiError};

/// Runs `steps` concurrently, at most `limit` at a time when `limit > 0`.
///
/// Children are admitted in declared order. A panicking child fails only
/// itself. With `fail_fast`, the first child that fails or errors cancels
/// the shared context: children not yet admitted never run, running ones
/// observe the cancellation and are waited for.
///
/// Returns the parent's cancellation if `ctx` is done, otherwise the
/// aggregated child errors, otherwise whether every child succeeded.
pub(crate) async fn run_parallel(
    ctx: &StepContext,
    state: &Arc<RunState>,
    steps: &[StepRef],
    limit: usize,
    fail_fast: bool,
) -> ExecResult<bool> {
    let run_ctx = ctx.child();
    let permits = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
    let mut tasks = JoinSet::new();

    for (index, step) in steps.iter().enumerate() {
        let permit = match &permits {
            Some(permits) => {
                let acquired = tokio::select! {
                    biased;
                    () = run_ctx.done() => None,
                    permit = Arc::clone(permits).acquire_owned() => permit.ok(),
                };
                match acquired {
                    Some(permit) => Some(permit),
                    None => break,
                }
            }
            None => None,
        };
        if run_ctx.err().is_some() {
            break;
        }

        let step = Arc::clone(step);
        let child_ctx = run_ctx.clone();
        let state = Arc::clone(state);
        tasks.spawn(async move {
            let _permit = permit;
            let result = AssertUnwindSafe(step.run(child_ctx.clone(), state))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    warn!(index, panic = %message, "parallel step panicked");
                    Err(ExecError::panic(format!("parallel step {index}"), message))
                });
            if fail_fast && !matches!(result, Ok(true)) {
                debug!(index, "failing fast");
                child_ctx.cancel();
            }
            result
        });
    }

    let admitted = tasks.len();
    let mut succeeded = admitted == steps.len();
    let mut errors = MultiError::new();
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|err| Err(ExecError::panic("parallel step", err.to_string())));
        match result {
            Ok(true) => {}
            Ok(false) => succeeded = false,
            Err(err) => {
                succeeded = false;
                if !err.is_cancelled() {
                    errors.push(err);
                }
            }
        }
    }

    if let Some(err) = ctx.err() {
        return Err(err);
    }
    errors.into_result()?;
    Ok(succeeded)
}

/// Runs children concurrently with an optional limit and fail-fast
pub struct InParallelStep {
    steps: Vec<StepRef>,
    limit: usize,
    fail_fast: bool,
    outcome: Outcome,
}

impl InParallelStep {
    /// Creates a parallel step; a `limit` of 0 is unbounded
    pub fn new(steps: Vec<StepRef>, limit: usize, fail_fast: bool) -> Self {
        Self {
            steps,
            limit,
            fail_fast,
            outcome: Outcome::default(),
        }
    }
}

#[async_trait]
impl Step for InParallelStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = run_parallel(&ctx, &state, &self.steps, self.limit, self.fail_fast).await;
        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}

/// Runs every child concurrently
pub struct AggregateStep {
    steps: Vec<StepRef>,
    outcome: Outcome,
}

impl AggregateStep {
    /// Creates an aggregate
    pub fn new(steps: Vec<StepRef>) -> Self {
        Self {
            steps,
            outcome: Outcome::default(),
        }
    }
}

#[async_trait]
impl Step for AggregateStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = run_parallel(&ctx, &state, &self.steps, 0, false).await;
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
    use crate::steps::testing::{state, Behavior, FakeStep};
    use crate::ExecErrorKind;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn steps(fakes: &[Arc<FakeStep>]) -> Vec<StepRef> {
        fakes.iter().map(FakeStep::as_step).collect()
    }

    #[tokio::test]
    async fn one_failing_child_fails_the_parent() {
        let fakes = vec![
            FakeStep::new(Behavior::Succeed),
            FakeStep::new(Behavior::Fail),
            FakeStep::new(Behavior::Succeed),
        ];
        let step = InParallelStep::new(steps(&fakes), 0, false);

        assert!(!step.run(StepContext::background(), state()).await.unwrap());
        assert!(!step.succeeded());
        assert!(fakes.iter().all(|fake| fake.runs() == 1));
    }

    #[tokio::test]
    async fn all_succeeding_children_succeed() {
        let fakes = vec![FakeStep::new(Behavior::Succeed), FakeStep::new(Behavior::Succeed)];
        let step = AggregateStep::new(steps(&fakes));
        assert!(step.run(StepContext::background(), state()).await.unwrap());
        assert!(step.succeeded());
    }

    #[tokio::test]
    async fn child_errors_are_aggregated() {
        let fakes = vec![
            FakeStep::new(Behavior::Error),
            FakeStep::new(Behavior::Succeed),
            FakeStep::new(Behavior::Error),
        ];
        let step = InParallelStep::new(steps(&fakes), 0, false);

        let err = step.run(StepContext::background(), state()).await.unwrap_err();
        let ExecErrorKind::Multi(multi) = err.kind() else {
            panic!("expected aggregate, got {err}");
        };
        assert_eq!(multi.errors().len(), 2);
        assert_eq!(fakes[1].runs(), 1);
    }

    #[tokio::test]
    async fn a_panicking_child_does_not_take_down_its_siblings() {
        let fakes = vec![FakeStep::new(Behavior::Panic), FakeStep::new(Behavior::Succeed)];
        let step = InParallelStep::new(steps(&fakes), 0, false);

        let err = step.run(StepContext::background(), state()).await.unwrap_err();
        assert!(err.to_string().contains("scripted panic"));
        assert_eq!(fakes[1].runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let fakes: Vec<_> = (0..5)
            .map(|_| FakeStep::tracked(Behavior::Sleep(Duration::from_secs(1)), running.clone(), peak.clone()))
            .collect();
        let step = InParallelStep::new(steps(&fakes), 2, false);

        assert!(step.run(StepContext::background(), state()).await.unwrap());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(fakes.iter().all(|fake| fake.runs() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_skips_children_not_yet_started() {
        let fakes = vec![
            FakeStep::new(Behavior::Fail),
            FakeStep::new(Behavior::Succeed),
            FakeStep::new(Behavior::Succeed),
        ];
        let step = InParallelStep::new(steps(&fakes), 1, true);

        assert!(!step.run(StepContext::background(), state()).await.unwrap());
        assert_eq!(fakes[0].runs(), 1);
        assert_eq!(fakes[1].runs() + fakes[2].runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_waits_for_running_children() {
        let fakes = vec![FakeStep::new(Behavior::Hang), FakeStep::new(Behavior::Error)];
        let step = InParallelStep::new(steps(&fakes), 0, true);

        let err = step.run(StepContext::background(), state()).await.unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(fakes[0].runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_reaches_every_running_child() {
        let fakes = vec![FakeStep::new(Behavior::Hang), FakeStep::new(Behavior::Hang)];
        let step = Arc::new(InParallelStep::new(steps(&fakes), 0, false));
        let ctx = StepContext::background();

        let running = tokio::spawn({
            let step = Arc::clone(&step);
            let ctx = ctx.clone();
            async move { step.run(ctx, state()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        let err = running.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(fakes.iter().all(|fake| fake.runs() == 1));
    }
}
