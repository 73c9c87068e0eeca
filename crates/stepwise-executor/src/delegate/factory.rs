use std::sync::Arc;

use stepwise_core::db::{Build, ResourceCatalog};
use stepwise_core::plan::{CheckPlan, PlanId};
use stepwise_events::BuildEventStore;

use super::{
    BuildStepDelegate, CheckConfig, CheckDelegate, CheckStepDelegate, DelegateFactory, EventDelegate,
    GetDelegate, PutDelegate, ResourceDelegate, TaskDelegate, TaskStepDelegate,
};
use crate::limiter::CheckRateLimiter;
use crate::vars::RedactionTracker;

/// Creates the delegates of one build
pub struct BuildDelegateFactory {
    build: Arc<dyn Build>,
    events: Arc<dyn BuildEventStore>,
    tracker: Arc<RedactionTracker>,
    catalog: Arc<dyn ResourceCatalog>,
    limiter: Arc<CheckRateLimiter>,
    check_config: CheckConfig,
}

impl BuildDelegateFactory {
    /// Creates a factory for `build`.
    ///
    /// Output is redacted with `tracker`, the build's redaction tracker.
    pub fn new(
        build: Arc<dyn Build>,
        events: Arc<dyn BuildEventStore>,
        tracker: Arc<RedactionTracker>,
        catalog: Arc<dyn ResourceCatalog>,
        limiter: Arc<CheckRateLimiter>,
        check_config: CheckConfig,
    ) -> Self {
        Self {
            build,
            events,
            tracker,
            catalog,
            limiter,
            check_config,
        }
    }

    fn events(&self, plan_id: &PlanId) -> EventDelegate {
        EventDelegate::new(
            self.build.id(),
            plan_id.clone(),
            Arc::clone(&self.events),
            Arc::clone(&self.tracker),
        )
    }

    fn resource_delegate(&self, plan_id: &PlanId) -> ResourceDelegate {
        ResourceDelegate::new(
            self.events(plan_id),
            Arc::clone(&self.catalog),
            self.build.metadata().pipeline_id,
        )
    }
}

impl DelegateFactory for BuildDelegateFactory {
    fn build_step_delegate(&self, plan_id: &PlanId) -> Arc<dyn BuildStepDelegate> {
        Arc::new(self.events(plan_id))
    }

    fn get_delegate(&self, plan_id: &PlanId) -> Arc<dyn GetDelegate> {
        Arc::new(self.resource_delegate(plan_id))
    }

    fn put_delegate(&self, plan_id: &PlanId) -> Arc<dyn PutDelegate> {
        Arc::new(self.resource_delegate(plan_id))
    }

    fn task_delegate(&self, plan_id: &PlanId) -> Arc<dyn TaskDelegate> {
        Arc::new(TaskStepDelegate::new(self.events(plan_id)))
    }

    fn check_delegate(&self, plan_id: &PlanId, plan: &CheckPlan) -> Arc<dyn CheckDelegate> {
        Arc::new(CheckStepDelegate::new(
            self.events(plan_id),
            plan.clone(),
            Arc::clone(&self.build),
            Arc::clone(&self.catalog),
            Arc::clone(&self.limiter),
            self.check_config.clone(),
        ))
    }
}
