//! Step lifecycle reporting.
//!
//! Every step reports through a [`BuildStepDelegate`]: `initializing` before
//! it resolves credentials, `starting` right before it hands work to a
//! worker, and `finished` once the worker returns. Step kinds that need
//! more add a small extension capability on top:
//!
//! - [`GetDelegate`]: reports fetched versions back to the catalog
//! - [`PutDelegate`]: saves produced versions as resource outputs
//! - [`TaskDelegate`]: fetches task images
//! - [`CheckDelegate`]: gates checks on the scope lock and the interval
//!
//! [`BuildDelegateFactory`] wires these to a build's event log.

/// Implements [`BuildStepDelegate`] by forwarding to an [`EventDelegate`] field
macro_rules! forward_build_step_delegate {
    ($ty:ty, $field:ident) => {
        impl $crate::delegate::BuildStepDelegate for $ty {
            fn initializing(&self) {
                self.$field.initializing();
            }

            fn starting(&self) {
                self.$field.starting();
            }

            fn finished(&self, succeeded: bool) {
                self.$field.finished(succeeded);
            }

            fn errored(&self, message: &str) {
                self.$field.errored(message);
            }

            fn selected_worker(&self, worker: &str) {
                self.$field.selected_worker(worker);
            }

            fn stdout(&self) -> $crate::delegate::OutputStream {
                self.$field.stdout()
            }

            fn stderr(&self) -> $crate::delegate::OutputStream {
                self.$field.stderr()
            }
        }
    };
}

pub(crate) use forward_build_step_delegate;

mod build_step;
mod check;
mod factory;
mod output;
mod resource;
mod task;

pub use build_step::EventDelegate;
pub(crate) use check::release;
pub use check::{CheckConfig, CheckStepDelegate};
pub use factory::BuildDelegateFactory;
pub use output::{EventWriter, OutputStream, RedactingWriter};
pub use resource::ResourceDelegate;
pub use task::TaskStepDelegate;

use async_trait::async_trait;
use std::sync::Arc;

use stepwise_core::db::{Lock, ResourceConfigScope};
use stepwise_core::plan::{CheckPlan, PlanId};
use stepwise_core::resource::{Source, VersionResult, VersionedResourceTypes};
use stepwise_core::task::ImageResource;

use crate::context::StepContext;
use crate::run_state::RunState;
use crate::worker::ImageSpec;
use crate::ExecResult;

/// Lifecycle events and output streams of one plan node
pub trait BuildStepDelegate: Send + Sync {
    /// The step began resolving its configuration
    fn initializing(&self);

    /// The step is about to hand work to a worker
    fn starting(&self);

    /// The step completed
    fn finished(&self, succeeded: bool);

    /// The step errored
    fn errored(&self, message: &str);

    /// A worker was chosen
    fn selected_worker(&self, worker: &str);

    /// Standard output of the step
    fn stdout(&self) -> OutputStream;

    /// Standard error of the step
    fn stderr(&self) -> OutputStream;
}

/// Get steps additionally report fetched versions
#[async_trait]
pub trait GetDelegate: BuildStepDelegate {
    /// The step completed with this script outcome
    fn finished_get(&self, exit_status: i32, result: &VersionResult);

    /// Records the version and metadata observed for a catalog resource
    async fn update_resource_version(&self, resource: &str, result: &VersionResult) -> ExecResult<()>;
}

/// Put steps additionally save what they produced
#[async_trait]
pub trait PutDelegate: BuildStepDelegate {
    /// The step completed with this script outcome
    fn finished_put(&self, exit_status: i32, result: &VersionResult);

    /// Saves the produced version as an output of a catalog resource
    async fn save_output(
        &self,
        resource: &str,
        source: &Source,
        resource_types: &VersionedResourceTypes,
        result: &VersionResult,
    ) -> ExecResult<()>;
}

/// Task steps additionally resolve their image
#[async_trait]
pub trait TaskDelegate: BuildStepDelegate {
    /// The step completed with this exit status
    fn finished_task(&self, exit_status: i32);

    /// Checks and fetches an image resource in a scope local to the step
    async fn fetch_image(
        &self,
        ctx: &StepContext,
        image: &ImageResource,
        resource_types: &VersionedResourceTypes,
        privileged: bool,
        tags: &[String],
        state: &Arc<RunState>,
    ) -> ExecResult<ImageSpec>;
}

/// Check steps additionally coordinate through the scope lock
#[async_trait]
pub trait CheckDelegate: BuildStepDelegate {
    /// Decides whether this check runs now.
    ///
    /// Returns the held lock and `true` when it does. The caller releases
    /// the lock once results are persisted.
    async fn wait_to_run(
        &self,
        ctx: &StepContext,
        scope: &dyn ResourceConfigScope,
    ) -> ExecResult<(Option<Box<dyn Lock>>, bool)>;

    /// Points the checked resource or type at `scope`
    async fn point_to_checked_config(&self, scope: &dyn ResourceConfigScope) -> ExecResult<()>;
}

/// Creates the delegates for one build's plan nodes
pub trait DelegateFactory: Send + Sync {
    /// Delegate for combinators and steps without extensions
    fn build_step_delegate(&self, plan_id: &PlanId) -> Arc<dyn BuildStepDelegate>;

    /// Delegate for a get step
    fn get_delegate(&self, plan_id: &PlanId) -> Arc<dyn GetDelegate>;

    /// Delegate for a put step
    fn put_delegate(&self, plan_id: &PlanId) -> Arc<dyn PutDelegate>;

    /// Delegate for a task step
    fn task_delegate(&self, plan_id: &PlanId) -> Arc<dyn TaskDelegate>;

    /// Delegate for a check step
    fn check_delegate(&self, plan_id: &PlanId, plan: &CheckPlan) -> Arc<dyn CheckDelegate>;
}
