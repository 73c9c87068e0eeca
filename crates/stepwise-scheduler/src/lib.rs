//! # Stepwise Scheduler
//!
//! Feeds the executor with resource checks.
//!
//! - `scanner`: decides which resources and resource types are due for a
//!   check and creates check builds for them
//! - `checker`: runs started check builds through the engine
//! - `runner`: ticks components until shutdown
//!
//! The scanner and checker never talk to each other directly: the scanner
//! signals [`stepwise_events::NEW_CHECKS`] after every scan and the checker
//! wakes up on it.

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod checker;
pub mod runner;
pub mod scanner;

pub use checker::Checker;
pub use runner::{run_periodically, Component};
pub use scanner::{Scanner, ScannerConfig};

use stepwise_core::db::StoreError;
use stepwise_core::{DurationError, PlannerError};

/// Scheduler result type
pub type SchedulerResult<T = ()> = Result<T, SchedulerError>;

/// Scheduler error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct SchedulerError(#[from] SchedulerErrorKind);

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum SchedulerErrorKind {
    /// A checkable declares an interval that does not parse
    #[error("invalid check interval '{value}': {source}")]
    InvalidInterval {
        /// The declared interval
        value: String,
        /// Why it did not parse
        #[source]
        source: DurationError,
    },

    /// The check plan could not be compiled
    #[error(transparent)]
    Plan(#[from] PlannerError),

    /// The store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// The error kind
    #[must_use]
    pub fn kind(&self) -> &SchedulerErrorKind {
        &self.0
    }
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        Self(SchedulerErrorKind::Store(e))
    }
}

impl From<PlannerError> for SchedulerError {
    fn from(e: PlannerError) -> Self {
        Self(SchedulerErrorKind::Plan(e))
    }
}
