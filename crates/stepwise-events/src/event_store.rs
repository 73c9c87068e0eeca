//! Build event persistence.
//!
//! Events are appended from inside output writers, which are synchronous,
//! so the store contract is synchronous as well.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::types::{BuildEvent, EventEnvelope, EventMetadata};

/// Event store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    /// The backing store rejected the write
    #[error("failed to save event for build {build_id}: {reason}")]
    SaveFailed {
        /// Build the event belonged to
        build_id: u64,
        /// Underlying failure
        reason: String,
    },

    /// The backing store could not be read
    #[error("failed to load events for build {build_id}: {reason}")]
    LoadFailed {
        /// Build whose events were requested
        build_id: u64,
        /// Underlying failure
        reason: String,
    },
}

/// Append-only log of build events
pub trait BuildEventStore: Send + Sync {
    /// Appends an event to a build's log
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SaveFailed`] when the write is rejected.
    fn save_event(&self, build_id: u64, event: BuildEvent) -> Result<(), EventStoreError>;

    /// A build's events in the order they were saved
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::LoadFailed`] when the log cannot be read.
    fn events(&self, build_id: u64) -> Result<Vec<EventEnvelope>, EventStoreError>;
}

/// Process-local event store
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: DashMap<u64, Vec<EventEnvelope>>,
    sequence: AtomicU64,
}

impl InMemoryEventStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A build's events without their envelopes
    #[must_use]
    pub fn build_events(&self, build_id: u64) -> Vec<BuildEvent> {
        self.events
            .get(&build_id)
            .map(|events| events.iter().map(|envelope| envelope.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Concatenated payloads of a build's log events
    #[must_use]
    pub fn log_output(&self, build_id: u64) -> String {
        self.build_events(build_id)
            .into_iter()
            .filter_map(|event| match event {
                BuildEvent::Log { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }
}

impl BuildEventStore for InMemoryEventStore {
    fn save_event(&self, build_id: u64, event: BuildEvent) -> Result<(), EventStoreError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(build_id, event_type = event.event_type(), "saving build event");
        self.events.entry(build_id).or_default().push(EventEnvelope {
            event,
            metadata: EventMetadata {
                event_id: Uuid::now_v7(),
                build_id,
                sequence,
            },
        });
        Ok(())
    }

    fn events(&self, build_id: u64) -> Result<Vec<EventEnvelope>, EventStoreError> {
        Ok(self
            .events
            .get(&build_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Origin, OriginSource};
    use pretty_assertions::assert_eq;
    use stepwise_core::PlanId;

    #[test]
    fn keeps_events_per_build_in_order() {
        let store = InMemoryEventStore::new();
        let origin = Origin::new(PlanId::new("1"));
        store.save_event(1, BuildEvent::initialize(origin.clone())).unwrap();
        store.save_event(2, BuildEvent::start(origin.clone())).unwrap();
        store.save_event(1, BuildEvent::finish(origin, true)).unwrap();

        let types: Vec<_> = store.build_events(1).iter().map(BuildEvent::event_type).collect();
        assert_eq!(types, vec!["initialize", "finish"]);

        let envelopes = store.events(1).unwrap();
        assert!(envelopes[0].metadata.sequence < envelopes[1].metadata.sequence);
        assert_eq!(store.events(3).unwrap().len(), 0);
    }

    #[test]
    fn log_output_concatenates_payloads() {
        let store = InMemoryEventStore::new();
        let origin = Origin::new(PlanId::new("1")).with_source(OriginSource::Stdout);
        store.save_event(1, BuildEvent::log(origin.clone(), "hello ")).unwrap();
        store.save_event(1, BuildEvent::log(origin, "world")).unwrap();
        assert_eq!(store.log_output(1), "hello world");
    }
}
