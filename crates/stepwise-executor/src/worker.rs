//! The container execution contract.
//!
//! A [`WorkerClient`] places a container on some worker, runs a resource
//! script or task process in it, and reports the exit status together with
//! whatever the script produced. How containers are scheduled and isolated
//! is up to the implementation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use stepwise_core::db::ResourceCache;
use stepwise_core::plan::PlanId;
use stepwise_core::resource::{Params, Source, Version, VersionResult, VersionedResourceTypes};

use crate::artifact::{Artifact, ArtifactHandle};
use crate::context::StepContext;
use crate::delegate::{BuildStepDelegate, OutputStream};

/// Worker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The script ran and exited non-zero
    #[error("resource script '{script}' failed: exit status {exit_status}\n\nstderr:\n{stderr}")]
    ScriptFailed {
        /// Script path
        script: String,
        /// Exit status
        exit_status: i32,
        /// Captured standard error
        stderr: String,
    },

    /// No worker satisfies the placement constraints
    #[error("no workers satisfying: {constraints}")]
    NoWorkers {
        /// Human-readable constraints
        constraints: String,
    },

    /// Creating or running the container failed
    #[error("container error: {reason}")]
    Container {
        /// Underlying failure
        reason: String,
    },

    /// A file could not be read from an artifact
    #[error("file '{path}' not found in artifact '{artifact}'")]
    FileNotFound {
        /// Artifact ID
        artifact: String,
        /// Path within the artifact
        path: String,
    },
}

/// Who a container belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOwner {
    /// Owning build
    pub build_id: u64,
    /// Owning plan node
    pub plan_id: PlanId,
    /// Owning team
    pub team_id: u64,
}

/// What the container runs on
#[derive(Debug, Clone, Default)]
pub struct ImageSpec {
    /// An artifact holding the root filesystem
    pub artifact: Option<ArtifactHandle>,
    /// A raw root filesystem URI
    pub url: Option<String>,
    /// A base resource type providing the image
    pub resource_type: Option<String>,
    /// Run privileged
    pub privileged: bool,
}

impl ImageSpec {
    /// The image of a base resource type
    pub fn for_resource_type(type_name: impl Into<String>) -> Self {
        Self {
            resource_type: Some(type_name.into()),
            ..Self::default()
        }
    }

    /// An image taken from an artifact
    #[must_use]
    pub fn from_artifact(artifact: ArtifactHandle) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::default()
        }
    }
}

/// An artifact mounted into a container
#[derive(Debug, Clone)]
pub struct InputSource {
    /// Artifact name in the repository
    pub name: String,
    /// The artifact
    pub artifact: ArtifactHandle,
    /// Mount path, relative to the working directory
    pub path: String,
}

/// How the container is set up
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Owning team
    pub team_id: u64,
    /// Root filesystem
    pub image: ImageSpec,
    /// `KEY=value` environment entries
    pub env: Vec<String>,
    /// Working directory
    pub dir: String,
    /// Mounted inputs
    pub inputs: Vec<InputSource>,
    /// Output name to directory path
    pub outputs: BTreeMap<String, String>,
}

/// Placement constraints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Required platform
    pub platform: Option<String>,
    /// Required base resource type
    pub resource_type: Option<String>,
    /// Required tags
    pub tags: Vec<String>,
    /// Team the worker must serve
    pub team_id: u64,
}

/// The process a task runs
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable
    pub path: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub dir: Option<String>,
    /// User
    pub user: Option<String>,
    /// Standard output
    pub stdout: OutputStream,
    /// Standard error
    pub stderr: OutputStream,
}

/// Input to a resource script
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    /// Resource type name
    pub type_name: String,
    /// Interpolated source
    pub source: Source,
    /// Interpolated params
    pub params: Params,
    /// Version to fetch, or to check from
    pub version: Option<Version>,
    /// Custom types visible to the script
    pub resource_types: VersionedResourceTypes,
}

/// Where a resource script writes its logs
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Standard output
    pub stdout: OutputStream,
    /// Standard error
    pub stderr: OutputStream,
}

/// Outcome of a `check` script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Discovered versions, oldest first
    pub versions: Vec<Version>,
}

/// Outcome of an `in` script
#[derive(Debug, Clone, Default)]
pub struct GetResult {
    /// Exit status
    pub exit_status: i32,
    /// Fetched version and metadata
    pub version_result: VersionResult,
    /// The fetched data; present on success
    pub artifact: Option<ArtifactHandle>,
}

/// Outcome of an `out` script
#[derive(Debug, Clone, Default)]
pub struct PutResult {
    /// Exit status
    pub exit_status: i32,
    /// Produced version and metadata
    pub version_result: VersionResult,
}

/// Outcome of a task process
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    /// Exit status
    pub exit_status: i32,
    /// Registered outputs by task output name
    pub outputs: BTreeMap<String, ArtifactHandle>,
}

/// Runs scripts and processes in containers
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Runs a resource type's `check` script.
    ///
    /// A non-zero exit is reported as [`WorkerError::ScriptFailed`].
    #[allow(clippy::too_many_arguments)]
    async fn run_check_step(
        &self,
        ctx: &StepContext,
        owner: ContainerOwner,
        container: ContainerSpec,
        worker: WorkerSpec,
        request: ResourceRequest,
        output: ScriptOutput,
        delegate: &dyn BuildStepDelegate,
        timeout: Duration,
    ) -> Result<CheckResult, WorkerError>;

    /// Runs a resource type's `in` script into `cache`
    #[allow(clippy::too_many_arguments)]
    async fn run_get_step(
        &self,
        ctx: &StepContext,
        owner: ContainerOwner,
        container: ContainerSpec,
        worker: WorkerSpec,
        request: ResourceRequest,
        cache: &ResourceCache,
        output: ScriptOutput,
        delegate: &dyn BuildStepDelegate,
    ) -> Result<GetResult, WorkerError>;

    /// Runs a resource type's `out` script
    #[allow(clippy::too_many_arguments)]
    async fn run_put_step(
        &self,
        ctx: &StepContext,
        owner: ContainerOwner,
        container: ContainerSpec,
        worker: WorkerSpec,
        request: ResourceRequest,
        output: ScriptOutput,
        delegate: &dyn BuildStepDelegate,
    ) -> Result<PutResult, WorkerError>;

    /// Runs a task process
    async fn run_task_step(
        &self,
        ctx: &StepContext,
        owner: ContainerOwner,
        container: ContainerSpec,
        worker: WorkerSpec,
        process: ProcessSpec,
        delegate: &dyn BuildStepDelegate,
    ) -> Result<TaskResult, WorkerError>;

    /// Reads one file out of an artifact
    async fn stream_file(
        &self,
        ctx: &StepContext,
        artifact: &dyn Artifact,
        path: &str,
    ) -> Result<Vec<u8>, WorkerError>;
}
