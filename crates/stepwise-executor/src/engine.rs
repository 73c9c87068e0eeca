//! Runs builds to completion.
//!
//! An [`EngineBuild`] owns one execution attempt of a build: it takes the
//! build's tracking lock, builds the step tree, runs it behind a panic
//! boundary and records the final status. Releasing the engine stops its
//! runs without finishing their builds, so another process (or a later
//! attempt of this one) can pick them up again.

use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use stepwise_core::build::BuildStatus;
use stepwise_core::db::Build;
use stepwise_core::PlanId;
use stepwise_events::{BuildEvent, BuildEventStore, Origin};

use crate::builder::StepBuilder;
use crate::context::StepContext;
use crate::delegate::release;
use crate::run_state::RunState;
use crate::steps::panic_message;
use crate::{ExecError, ExecResult};

/// Run states of the builds this engine is running, by build ID
#[derive(Default)]
pub struct RunStateRegistry {
    states: DashMap<u64, Arc<RunState>>,
}

impl RunStateRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The run state of `build_id`, if an attempt left one behind
    #[must_use]
    pub fn get(&self, build_id: u64) -> Option<Arc<RunState>> {
        self.states.get(&build_id).map(|state| Arc::clone(state.value()))
    }

    /// The registered run state, or the one `create` returns
    pub fn get_or_insert_with(&self, build_id: u64, create: impl FnOnce() -> RunState) -> Arc<RunState> {
        Arc::clone(self.states.entry(build_id).or_insert_with(|| Arc::new(create())).value())
    }

    /// Forgets `build_id`
    pub fn remove(&self, build_id: u64) {
        self.states.remove(&build_id);
    }

    /// Number of registered run states
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no run state is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Runs builds
pub struct Engine {
    builder: Arc<dyn StepBuilder>,
    events: Arc<dyn BuildEventStore>,
    registry: Arc<RunStateRegistry>,
    release: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    /// Creates an engine building steps with `builder`
    pub fn new(builder: Arc<dyn StepBuilder>, events: Arc<dyn BuildEventStore>) -> Self {
        Self {
            builder,
            events,
            registry: Arc::new(RunStateRegistry::new()),
            release: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// The run states of in-flight builds
    #[must_use]
    pub fn registry(&self) -> &Arc<RunStateRegistry> {
        &self.registry
    }

    /// Prepares an execution attempt of `build`
    #[must_use]
    pub fn new_build(&self, build: Arc<dyn Build>) -> EngineBuild {
        EngineBuild {
            build,
            builder: Arc::clone(&self.builder),
            events: Arc::clone(&self.events),
            registry: Arc::clone(&self.registry),
            release: self.release.clone(),
            tracker: self.tracker.clone(),
        }
    }

    /// Releases every running build and waits for their runs to stop
    pub async fn drain(&self) {
        info!(running = self.tracker.len(), "draining engine");
        self.release.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("engine drained");
    }
}

/// One execution attempt of a build
pub struct EngineBuild {
    build: Arc<dyn Build>,
    builder: Arc<dyn StepBuilder>,
    events: Arc<dyn BuildEventStore>,
    registry: Arc<RunStateRegistry>,
    release: CancellationToken,
    tracker: TaskTracker,
}

impl EngineBuild {
    /// Runs the build unless another attempt holds it or it already finished
    pub async fn run(self) {
        let id = self.build.id();
        if self.release.is_cancelled() {
            debug!(build = id, "engine released, not starting build");
            return;
        }

        let lock = match self.build.acquire_tracking_lock().await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!(build = id, "build is tracked elsewhere");
                return;
            }
            Err(err) => {
                error!(build = id, error = %err, "failed to acquire tracking lock");
                return;
            }
        };

        self.run_locked().await;
        release(lock).await;
    }

    async fn run_locked(&self) {
        let id = self.build.id();
        match self.build.reload().await {
            Ok(true) => {}
            Ok(false) => {
                info!(build = id, "build disappeared");
                return;
            }
            Err(err) => {
                error!(build = id, error = %err, "failed to reload build");
                return;
            }
        }
        match self.build.status().await {
            Ok(status) if status.is_running() => {}
            Ok(status) => {
                debug!(build = id, %status, "build already finished");
                return;
            }
            Err(err) => {
                error!(build = id, error = %err, "failed to load build status");
                return;
            }
        }

        let ctx = StepContext::new(self.build.abort_signal()).child();
        let vars = self.registry.get(id).map(|state| Arc::clone(state.vars()));
        let built = match self.builder.build_step(Arc::clone(&self.build), vars).await {
            Ok(built) => built,
            Err(err) => {
                error!(build = id, error = %err, "failed to build step tree");
                self.save(BuildEvent::error(origin(PlanId::default()), err.to_string()));
                self.finish(BuildStatus::Errored).await;
                return;
            }
        };
        let state = self
            .registry
            .get_or_insert_with(id, || RunState::new(built.vars, Some(built.runner)));

        info!(build = id, "running build");
        let step = built.step;
        let run_ctx = ctx.clone();
        let mut handle = self.tracker.spawn(async move {
            AssertUnwindSafe(step.run(run_ctx, state))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    warn!(build = id, panic = %message, "build panicked");
                    Err(ExecError::panic(format!("build {id}"), message))
                })
        });

        let result: ExecResult<bool> = tokio::select! {
            biased;
            joined = &mut handle => {
                joined.unwrap_or_else(|err| Err(ExecError::panic(format!("build {id}"), err.to_string())))
            }
            () = self.release.cancelled() => {
                info!(build = id, "releasing build");
                ctx.cancel();
                if let Err(err) = handle.await {
                    warn!(build = id, error = %err, "released build did not stop cleanly");
                }
                return;
            }
        };

        let status = match result {
            Ok(true) => BuildStatus::Succeeded,
            Ok(false) => BuildStatus::Failed,
            Err(err) if err.is_cancelled() && self.build.abort_signal().is_cancelled() => BuildStatus::Aborted,
            Err(err) => {
                error!(build = id, error = %err, "build errored");
                self.save(BuildEvent::error(origin(built.plan_id), err.to_string()));
                BuildStatus::Errored
            }
        };
        self.finish(status).await;
        self.registry.remove(id);
    }

    async fn finish(&self, status: BuildStatus) {
        let id = self.build.id();
        if let Err(err) = self.build.finish(status).await {
            error!(build = id, %status, error = %err, "failed to finish build");
            return;
        }
        self.save(BuildEvent::status(status));
        info!(build = id, %status, "build finished");
    }

    fn save(&self, event: BuildEvent) {
        let id = self.build.id();
        if let Err(err) = self.events.save_event(id, event) {
            error!(build = id, error = %err, "failed to save build event");
        }
    }
}

fn origin(id: PlanId) -> Origin {
    Origin { id, source: None }
}
