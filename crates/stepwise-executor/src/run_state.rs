//! Per-build execution state.
//!
//! A [`RunState`] is threaded through every step of a build. It carries the
//! artifact repository, the build variables, and a results table where a
//! step stores a value under its plan ID for later steps to read.
//!
//! Images fetched for custom resource types live in their own table so that
//! puts and tasks, which see every build artifact, never see them.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use stepwise_core::plan::{Plan, PlanId};

use crate::artifact::ArtifactRepository;
use crate::context::StepContext;
use crate::vars::BuildVariables;
use crate::{ExecErrorKind, ExecResult};

/// Runs plans created while a build is running, e.g. image fetches
#[async_trait]
pub trait PlanRunner: Send + Sync {
    /// Builds and runs `plan` against `state`
    async fn run_plan(&self, ctx: StepContext, plan: &Plan, state: Arc<RunState>) -> ExecResult<bool>;
}

/// State shared by every step of a build
pub struct RunState {
    artifacts: Arc<ArtifactRepository>,
    images: Arc<ArtifactRepository>,
    vars: Arc<BuildVariables>,
    results: Arc<DashMap<PlanId, Value>>,
    runner: Option<Arc<dyn PlanRunner>>,
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("artifacts", &self.artifacts)
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

impl RunState {
    /// Creates the root state of a build
    pub fn new(vars: Arc<BuildVariables>, runner: Option<Arc<dyn PlanRunner>>) -> Self {
        Self {
            artifacts: Arc::new(ArtifactRepository::new()),
            images: Arc::new(ArtifactRepository::new()),
            vars,
            results: Arc::new(DashMap::new()),
            runner,
        }
    }

    /// Artifacts visible to this scope
    #[must_use]
    pub fn artifacts(&self) -> &Arc<ArtifactRepository> {
        &self.artifacts
    }

    /// Custom type images visible to this scope
    #[must_use]
    pub fn images(&self) -> &Arc<ArtifactRepository> {
        &self.images
    }

    /// Variables visible to this scope
    #[must_use]
    pub fn vars(&self) -> &Arc<BuildVariables> {
        &self.vars
    }

    /// A scope whose artifacts, images and variables do not leak into `self`.
    ///
    /// The results table is shared.
    #[must_use]
    pub fn new_local_scope(&self) -> Arc<Self> {
        Arc::new(Self {
            artifacts: self.artifacts.new_local_scope(),
            images: self.images.new_local_scope(),
            vars: self.vars.new_local_scope(),
            results: Arc::clone(&self.results),
            runner: self.runner.clone(),
        })
    }

    /// Stores a step's result under its plan ID
    ///
    /// # Errors
    ///
    /// Fails when `value` cannot be encoded.
    pub fn store_result<T: Serialize>(&self, plan_id: &PlanId, value: &T) -> ExecResult<()> {
        self.results.insert(plan_id.clone(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Reads a stored result, if present and of the expected shape
    #[must_use]
    pub fn result<T: DeserializeOwned>(&self, plan_id: &PlanId) -> Option<T> {
        let value = self.results.get(plan_id)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Runs a plan that was not part of the compiled tree
    ///
    /// # Errors
    ///
    /// Fails when no runner is attached, or with the plan's own error.
    pub async fn run(self: &Arc<Self>, ctx: StepContext, plan: &Plan) -> ExecResult<bool> {
        let runner = self.runner.as_ref().ok_or_else(|| ExecErrorKind::NoPlanRunner {
            plan_id: plan.id.clone(),
        })?;
        runner.run_plan(ctx, plan, Arc::clone(self)).await
    }
}
