use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Checkable, Lock, StoreResult};
use crate::build::{BuildMetadata, BuildStatus};
use crate::plan::Plan;

/// A persisted build
#[async_trait]
pub trait Build: Send + Sync + fmt::Debug {
    /// Build ID
    fn id(&self) -> u64;

    /// Identity exposed to steps
    fn metadata(&self) -> &BuildMetadata;

    /// Whether an operator asked for this build
    fn is_manually_triggered(&self) -> bool;

    /// The compiled plan
    async fn plan(&self) -> StoreResult<Plan>;

    /// Refreshes persisted state, returning whether the build still exists
    async fn reload(&self) -> StoreResult<bool>;

    /// Current status
    async fn status(&self) -> StoreResult<BuildStatus>;

    /// Takes the lock ensuring one process runs this build at a time
    async fn acquire_tracking_lock(&self) -> StoreResult<Option<Box<dyn Lock>>>;

    /// Cancelled when the build is aborted
    fn abort_signal(&self) -> CancellationToken;

    /// Records the final status
    async fn finish(&self, status: BuildStatus) -> StoreResult<()>;
}

/// Creates and lists builds
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Creates a started check build, unless one is already running for the checkable
    async fn create_check_build(
        &self,
        checkable: &dyn Checkable,
        plan: Plan,
        manually_triggered: bool,
    ) -> StoreResult<Option<Arc<dyn Build>>>;

    /// Creates a started build
    async fn create_build(&self, metadata: BuildMetadata, plan: Plan) -> StoreResult<Arc<dyn Build>>;

    /// Every build that has not finished
    async fn started_builds(&self) -> StoreResult<Vec<Arc<dyn Build>>>;

    /// Check builds that have not finished, manually triggered ones first
    async fn started_check_builds(&self) -> StoreResult<Vec<Arc<dyn Build>>>;

    /// Finds a build by ID
    async fn find_build(&self, id: u64) -> StoreResult<Option<Arc<dyn Build>>>;

    /// Signals a running build to abort, returning whether it was running
    async fn abort_build(&self, id: u64) -> StoreResult<bool>;
}
