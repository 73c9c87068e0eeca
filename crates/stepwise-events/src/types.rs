//! Events a build emits while it runs.
//!
//! Every step-level event carries the [`Origin`] plan node, so observers
//! can attribute output and lifecycle changes to one node of the plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwise_core::build::BuildStatus;
use stepwise_core::plan::{Plan, PlanId};
use stepwise_core::resource::{MetadataField, Version};
use uuid::Uuid;

/// Which output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// The plan node an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Plan node ID
    pub id: PlanId,
    /// Output stream, for log events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OriginSource>,
}

impl Origin {
    /// Origin of a lifecycle event
    #[must_use]
    pub fn new(id: PlanId) -> Self {
        Self { id, source: None }
    }

    /// Origin of a log event
    #[must_use]
    pub fn with_source(mut self, source: OriginSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// Something that happened during a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum BuildEvent {
    /// The build changed status
    Status {
        /// New status
        status: BuildStatus,
        /// When
        time: DateTime<Utc>,
    },
    /// A step began resolving its configuration
    Initialize {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
    },
    /// A step handed work to a worker
    Start {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
    },
    /// A step without a dedicated finish event completed
    Finish {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Outcome
        succeeded: bool,
    },
    /// A get step completed
    FinishGet {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Script exit status
        exit_status: i32,
        /// Fetched version
        version: Version,
        /// Reported metadata
        metadata: Vec<MetadataField>,
    },
    /// A put step completed
    FinishPut {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Script exit status
        exit_status: i32,
        /// Produced version
        version: Version,
        /// Reported metadata
        metadata: Vec<MetadataField>,
    },
    /// A task step completed
    FinishTask {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Process exit status
        exit_status: i32,
    },
    /// Output written by a step
    Log {
        /// Step and stream
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Text, already redacted
        payload: String,
    },
    /// A step errored
    Error {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Error message
        message: String,
    },
    /// A worker was chosen for a step
    SelectedWorker {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// Worker name
        worker: String,
    },
    /// A step's image is being checked
    ImageCheck {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// The check plan
        plan: Plan,
    },
    /// A step's image is being fetched
    ImageGet {
        /// Step
        origin: Origin,
        /// When
        time: DateTime<Utc>,
        /// The get plan
        plan: Plan,
    },
}

impl BuildEvent {
    /// `Initialize` at the current time
    #[must_use]
    pub fn initialize(origin: Origin) -> Self {
        Self::Initialize {
            origin,
            time: Utc::now(),
        }
    }

    /// `Start` at the current time
    #[must_use]
    pub fn start(origin: Origin) -> Self {
        Self::Start {
            origin,
            time: Utc::now(),
        }
    }

    /// `Finish` at the current time
    #[must_use]
    pub fn finish(origin: Origin, succeeded: bool) -> Self {
        Self::Finish {
            origin,
            time: Utc::now(),
            succeeded,
        }
    }

    /// `Log` at the current time
    #[must_use]
    pub fn log(origin: Origin, payload: impl Into<String>) -> Self {
        Self::Log {
            origin,
            time: Utc::now(),
            payload: payload.into(),
        }
    }

    /// `Error` at the current time
    #[must_use]
    pub fn error(origin: Origin, message: impl Into<String>) -> Self {
        Self::Error {
            origin,
            time: Utc::now(),
            message: message.into(),
        }
    }

    /// `Status` at the current time
    #[must_use]
    pub fn status(status: BuildStatus) -> Self {
        Self::Status {
            status,
            time: Utc::now(),
        }
    }

    /// Name of the event as persisted
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Initialize { .. } => "initialize",
            Self::Start { .. } => "start",
            Self::Finish { .. } => "finish",
            Self::FinishGet { .. } => "finish-get",
            Self::FinishPut { .. } => "finish-put",
            Self::FinishTask { .. } => "finish-task",
            Self::Log { .. } => "log",
            Self::Error { .. } => "error",
            Self::SelectedWorker { .. } => "selected-worker",
            Self::ImageCheck { .. } => "image-check",
            Self::ImageGet { .. } => "image-get",
        }
    }

    /// The plan node the event belongs to; `None` for build status
    #[must_use]
    pub fn origin(&self) -> Option<&Origin> {
        match self {
            Self::Status { .. } => None,
            Self::Initialize { origin, .. }
            | Self::Start { origin, .. }
            | Self::Finish { origin, .. }
            | Self::FinishGet { origin, .. }
            | Self::FinishPut { origin, .. }
            | Self::FinishTask { origin, .. }
            | Self::Log { origin, .. }
            | Self::Error { origin, .. }
            | Self::SelectedWorker { origin, .. }
            | Self::ImageCheck { origin, .. }
            | Self::ImageGet { origin, .. } => Some(origin),
        }
    }
}

/// Bookkeeping attached to a persisted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique, time-ordered event ID
    pub event_id: Uuid,
    /// Build the event belongs to
    pub build_id: u64,
    /// Position within the build's event log
    pub sequence: u64,
}

/// A persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event
    pub event: BuildEvent,
    /// Bookkeeping
    pub metadata: EventMetadata,
}
