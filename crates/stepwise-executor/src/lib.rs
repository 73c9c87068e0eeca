//! # Stepwise Executor
//!
//! Runs compiled plans. Every plan node becomes a [`Step`]; combinator steps
//! wrap the steps built for their children, and leaf steps hand work to a
//! [`WorkerClient`].
//!
//! ## Architecture
//!
//! - `context`: cancellation and deadlines threaded through a run
//! - `artifact`: the scoped artifact repository
//! - `vars`: build variables, interpolation and redaction
//! - `run_state`: per-build state shared by every step
//! - `steps`: one step per plan variant
//! - `delegate`: lifecycle events and output streams
//! - `worker`: the container execution contract
//! - `builder`: turns plans into steps
//! - `limiter`: spaces periodic checks
//! - `engine`: runs builds to completion
//!
//! ## Outcomes
//!
//! A step returns `Ok(true)` when it succeeded, `Ok(false)` when its work
//! ran to completion without succeeding, and `Err` when it could not run.
//! Cancellation is an error that every combinator propagates.

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod builder;
pub mod context;
pub mod delegate;
pub mod engine;
pub mod limiter;
pub mod run_state;
pub mod step;
pub mod steps;
pub mod vars;
pub mod worker;

pub use artifact::{Artifact, ArtifactHandle, ArtifactRepository, VolumeArtifact};
pub use builder::{Builder, BuiltStep, StepBuilder, StepFactory};
pub use context::StepContext;
pub use delegate::{BuildStepDelegate, CheckConfig, DelegateFactory, OutputStream};
pub use engine::{Engine, EngineBuild, RunStateRegistry};
pub use limiter::{CheckRateLimiter, CheckableCounter, LimiterConfig};
pub use run_state::{PlanRunner, RunState};
pub use step::Step;
pub use vars::{BuildVariables, RedactionTracker, Secrets, StaticSecrets, VarsError};
pub use worker::{WorkerClient, WorkerError};

use std::fmt;

use stepwise_core::db::StoreError;
use stepwise_core::{DurationError, PlanId};

/// Executor result type
pub type ExecResult<T = ()> = Result<T, ExecError>;

/// Executor error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ExecError(#[from] ExecErrorKind);

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum ExecErrorKind {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("panic in {context}: {message}")]
    Panic { context: String, message: String },

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("invalid duration '{value}': {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: DurationError,
    },

    #[error("artifact '{name}' not found")]
    ArtifactNotFound { name: String },

    #[error(transparent)]
    Vars(#[from] VarsError),

    #[error("worker: {source}")]
    Worker {
        #[source]
        source: WorkerError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid task configuration: {reason}")]
    TaskConfig { reason: String },

    #[error("invalid pipeline configuration: {reason}")]
    PipelineConfig { reason: String },

    #[error("failed to parse '{file}' as {format}: {reason}")]
    ParseFile {
        file: String,
        format: String,
        reason: String,
    },

    #[error("invalid file path '{path}', expected <artifact>/<path>")]
    InvalidFilePath { path: String },

    #[error("no version was produced by plan {plan_id}")]
    VersionNotFound { plan_id: PlanId },

    #[error("failed to fetch image: {reason}")]
    ImageFetch { reason: String },

    #[error("no plan runner to run plan {plan_id}")]
    NoPlanRunner { plan_id: PlanId },

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ExecError>,
    },
}

impl ExecError {
    /// The error kind
    #[must_use]
    pub fn kind(&self) -> &ExecErrorKind {
        &self.0
    }

    /// The build or branch was canceled
    #[must_use]
    pub fn cancelled() -> Self {
        ExecErrorKind::Cancelled.into()
    }

    /// A deadline passed
    #[must_use]
    pub fn deadline_exceeded() -> Self {
        ExecErrorKind::DeadlineExceeded.into()
    }

    /// A concurrent unit of work panicked
    pub fn panic(context: impl Into<String>, message: impl Into<String>) -> Self {
        ExecErrorKind::Panic {
            context: context.into(),
            message: message.into(),
        }
        .into()
    }

    /// Attaches the name of the step that raised the error
    #[must_use]
    pub fn in_step(self, step: impl Into<String>) -> Self {
        ExecErrorKind::Step {
            step: step.into(),
            source: Box::new(self),
        }
        .into()
    }

    /// Whether the error is, or only wraps, a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match &self.0 {
            ExecErrorKind::Cancelled => true,
            ExecErrorKind::Step { source, .. } => source.is_cancelled(),
            ExecErrorKind::Multi(multi) => {
                !multi.is_empty() && multi.errors().iter().all(ExecError::is_cancelled)
            }
            _ => false,
        }
    }

    /// Whether the error is, or only wraps, a passed deadline
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        match &self.0 {
            ExecErrorKind::DeadlineExceeded => true,
            ExecErrorKind::Step { source, .. } => source.is_deadline_exceeded(),
            ExecErrorKind::Multi(multi) => {
                !multi.is_empty() && multi.errors().iter().all(ExecError::is_deadline_exceeded)
            }
            _ => false,
        }
    }
}

impl From<StoreError> for ExecError {
    fn from(e: StoreError) -> Self {
        Self(ExecErrorKind::Store(e))
    }
}

impl From<VarsError> for ExecError {
    fn from(e: VarsError) -> Self {
        Self(ExecErrorKind::Vars(e))
    }
}

impl From<WorkerError> for ExecError {
    fn from(e: WorkerError) -> Self {
        Self(ExecErrorKind::Worker { source: e })
    }
}

impl From<MultiError> for ExecError {
    fn from(e: MultiError) -> Self {
        Self(ExecErrorKind::Multi(e))
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(e: serde_json::Error) -> Self {
        Self(ExecErrorKind::Encode(e))
    }
}

/// Errors raised by several concurrent branches
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<ExecError>,
}

impl MultiError {
    /// Creates an empty aggregate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an error, flattening nested aggregates
    pub fn push(&mut self, error: ExecError) {
        match error.0 {
            ExecErrorKind::Multi(nested) => self.errors.extend(nested.errors),
            kind => self.errors.push(ExecError(kind)),
        }
    }

    /// The aggregated errors
    #[must_use]
    pub fn errors(&self) -> &[ExecError] {
        &self.errors
    }

    /// True when nothing was aggregated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok` when empty, otherwise the aggregate as an error
    ///
    /// # Errors
    ///
    /// Returns the aggregate when it holds at least one error.
    pub fn into_result(self) -> ExecResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.into())
        }
    }
}

impl FromIterator<ExecError> for MultiError {
    fn from_iter<I: IntoIterator<Item = ExecError>>(iter: I) -> Self {
        let mut multi = Self::new();
        for error in iter {
            multi.push(error);
        }
        multi
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.errors.len();
        write!(
            f,
            "{count} error{} occurred:",
            if count == 1 { "" } else { "s" }
        )?;
        for error in &self.errors {
            write!(f, "\n\t* {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn multi_error_lists_every_message() {
        let multi: MultiError = vec![
            ExecError::panic("step", "boom"),
            ExecErrorKind::ArtifactNotFound {
                name: "repo".into(),
            }
            .into(),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            multi.to_string(),
            "2 errors occurred:\n\t* panic in step: boom\n\t* artifact 'repo' not found"
        );
    }

    #[test]
    fn nested_aggregates_are_flattened() {
        let inner: MultiError = vec![ExecError::cancelled(), ExecError::cancelled()]
            .into_iter()
            .collect();
        let mut outer = MultiError::new();
        outer.push(inner.into());
        assert_eq!(outer.errors().len(), 2);
        assert!(ExecError::from(outer).is_cancelled());
    }

    #[test]
    fn cancellation_is_visible_through_step_wrappers() {
        let err = ExecError::cancelled().in_step("unit");
        assert!(err.is_cancelled());
        assert!(!err.is_deadline_exceeded());
        assert_eq!(err.to_string(), "unit: context canceled");

        let err = ExecError::deadline_exceeded().in_step("unit");
        assert!(err.is_deadline_exceeded());
        assert!(!err.is_cancelled());
    }
}
