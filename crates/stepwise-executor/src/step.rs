//! The runtime counterpart of a plan node.

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::StepContext;
use crate::run_state::RunState;
use crate::ExecResult;

/// A runnable plan node.
///
/// `run` returns `Ok(true)` on success, `Ok(false)` when the work completed
/// without succeeding, and `Err` when it could not be carried out.
#[async_trait]
pub trait Step: Send + Sync {
    /// Runs the step
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool>;

    /// Whether the last run succeeded
    fn succeeded(&self) -> bool;
}

/// A shared step
pub type StepRef = Arc<dyn Step>;
