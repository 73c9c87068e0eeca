//! # Stepwise Events
//!
//! Build events and process-local notifications.
//!
//! ## Architecture
//!
//! - `types`: the events a build emits while it runs
//! - `event_store`: where build events are persisted
//! - `event_bus`: wake-ups between components, e.g. "new checks available"
//!
//! ## Example
//!
//! ```rust
//! use stepwise_events::{BuildEvent, BuildEventStore, InMemoryEventStore, Origin};
//! use stepwise_core::PlanId;
//!
//! let store = InMemoryEventStore::new();
//! store.save_event(1, BuildEvent::initialize(Origin::new(PlanId::new("1")))).unwrap();
//! assert_eq!(store.build_events(1).len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod event_bus;
pub mod event_store;
pub mod types;

pub use event_bus::{NEW_CHECKS, NotificationBus, Notifications};
pub use event_store::{BuildEventStore, EventStoreError, InMemoryEventStore};
pub use types::{BuildEvent, EventEnvelope, EventMetadata, Origin, OriginSource};
