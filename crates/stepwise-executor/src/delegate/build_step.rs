use std::sync::Arc;

use stepwise_core::plan::PlanId;
use stepwise_events::{BuildEvent, BuildEventStore, Origin, OriginSource};

use super::output::{EventWriter, OutputStream, RedactingWriter};
use super::BuildStepDelegate;
use crate::vars::RedactionTracker;

/// Reports one plan node's lifecycle to the build's event log
#[derive(Clone)]
pub struct EventDelegate {
    build_id: u64,
    plan_id: PlanId,
    events: Arc<dyn BuildEventStore>,
    tracker: Arc<RedactionTracker>,
}

impl EventDelegate {
    /// Creates a delegate for `plan_id` of `build_id`
    pub fn new(
        build_id: u64,
        plan_id: PlanId,
        events: Arc<dyn BuildEventStore>,
        tracker: Arc<RedactionTracker>,
    ) -> Self {
        Self {
            build_id,
            plan_id,
            events,
            tracker,
        }
    }

    /// The plan node events are attributed to
    #[must_use]
    pub fn origin(&self) -> Origin {
        Origin::new(self.plan_id.clone())
    }

    /// The plan node ID
    #[must_use]
    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Saves an event, logging failures
    pub fn save(&self, event: BuildEvent) {
        let event_type = event.event_type();
        if let Err(err) = self.events.save_event(self.build_id, event) {
            tracing::error!(
                build = self.build_id,
                plan = %self.plan_id,
                event_type,
                error = %err,
                "failed to save build event"
            );
        }
    }

    fn stream(&self, source: OriginSource) -> OutputStream {
        let writer = EventWriter::new(
            Arc::clone(&self.events),
            self.build_id,
            self.origin().with_source(source),
        );
        if self.tracker.enabled() {
            OutputStream::new(RedactingWriter::new(writer, Arc::clone(&self.tracker)))
        } else {
            OutputStream::new(writer)
        }
    }
}

impl BuildStepDelegate for EventDelegate {
    fn initializing(&self) {
        tracing::debug!(build = self.build_id, plan = %self.plan_id, "initializing");
        self.save(BuildEvent::initialize(self.origin()));
    }

    fn starting(&self) {
        tracing::info!(build = self.build_id, plan = %self.plan_id, "starting");
        self.save(BuildEvent::start(self.origin()));
    }

    fn finished(&self, succeeded: bool) {
        tracing::info!(build = self.build_id, plan = %self.plan_id, succeeded, "finished");
        self.save(BuildEvent::finish(self.origin(), succeeded));
    }

    fn errored(&self, message: &str) {
        tracing::info!(build = self.build_id, plan = %self.plan_id, error = message, "errored");
        self.save(BuildEvent::error(self.origin(), message));
    }

    fn selected_worker(&self, worker: &str) {
        self.save(BuildEvent::SelectedWorker {
            origin: self.origin(),
            time: chrono::Utc::now(),
            worker: worker.to_string(),
        });
    }

    fn stdout(&self) -> OutputStream {
        self.stream(OriginSource::Stdout)
    }

    fn stderr(&self) -> OutputStream {
        self.stream(OriginSource::Stderr)
    }
}
