//! Cancellation and deadlines for a run.
//!
//! A [`StepContext`] is handed to every step. It is cancelled when the build
//! is aborted or when a parallel parent fails fast, and it may carry a
//! deadline set by an enclosing timeout step.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{ExecError, ExecResult};

/// Cancellation token plus an optional deadline
#[derive(Debug, Clone)]
pub struct StepContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for StepContext {
    fn default() -> Self {
        Self::background()
    }
}

impl StepContext {
    /// Wraps an existing token, e.g. a build's abort signal
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context that is never cancelled by anyone else
    #[must_use]
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// A context cancelled with this one, and cancellable on its own
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context that also expires after `timeout`.
    ///
    /// An earlier deadline inherited from this context wins.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let requested = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < requested => existing,
            _ => requested,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// A fresh context for work that must run after this one was cancelled
    #[must_use]
    pub fn detached(&self) -> Self {
        Self::background()
    }

    /// Cancels this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The underlying token
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the context is done, or `None` while it is live
    #[must_use]
    pub fn err(&self) -> Option<ExecError> {
        if self.token.is_cancelled() {
            Some(ExecError::cancelled())
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(ExecError::deadline_exceeded())
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Runs `fut` unless the context is done first.
    ///
    /// A context that is already done never polls `fut`.
    ///
    /// # Errors
    ///
    /// Returns the cancellation or deadline error when the context finishes
    /// before `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> ExecResult<F::Output> {
        tokio::select! {
            biased;
            () = self.done() => Err(self.err().unwrap_or_else(ExecError::cancelled)),
            output = fut => Ok(output),
        }
    }

    /// Sleeps for `duration` unless the context is done first
    ///
    /// # Errors
    ///
    /// Returns the cancellation or deadline error when interrupted.
    pub async fn sleep(&self, duration: Duration) -> ExecResult<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}
