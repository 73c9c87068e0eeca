//! The plan tree.
//!
//! A [`Plan`] is the compiled, immutable description of one step. Every
//! node carries an ID unique within its build, so results and events can
//! be keyed by node across process restarts. Plans serialize as a tagged
//! union: `{"id": "a", "get": {...}}`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::resource::{Params, Source, Version, VersionedResourceTypes};
use crate::task::TaskConfig;

/// Identifier of a plan node, unique within one build
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    /// Wraps an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the ID of a sub-plan created at runtime, e.g. `a/image-get`
    #[must_use]
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}/{suffix}", self.0))
    }

    /// The identifier as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Hands out plan nodes with increasing IDs
#[derive(Debug)]
pub struct PlanFactory {
    current: AtomicU64,
}

impl PlanFactory {
    /// Creates a factory; the first plan gets `starting_id + 1`
    #[must_use]
    pub fn new(starting_id: u64) -> Self {
        Self {
            current: AtomicU64::new(starting_id),
        }
    }

    /// Wraps `kind` in a node with the next ID
    pub fn new_plan(&self, kind: impl Into<PlanKind>) -> Plan {
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        Plan {
            id: PlanId(format!("{id:x}")),
            kind: kind.into(),
        }
    }
}

/// One node of a compiled plan tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Node identifier
    pub id: PlanId,
    /// What this node does
    #[serde(flatten)]
    pub kind: PlanKind,
}

/// The variant of a plan node and its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Run a task
    Task(TaskPlan),
    /// Check a resource for new versions
    Check(CheckPlan),
    /// Fetch a resource version
    Get(GetPlan),
    /// Publish to a resource
    Put(PutPlan),
    /// Run children in sequence
    Do(Vec<Plan>),
    /// Run children concurrently
    Aggregate(Vec<Plan>),
    /// Run children concurrently with a limit
    InParallel(InParallelPlan),
    /// Run a step once per combination of variable values
    Across(AcrossPlan),
    /// Run a step, ignoring its failure
    Try(TryPlan),
    /// Run a step with a deadline
    Timeout(TimeoutPlan),
    /// Run attempts until one succeeds
    Retry(Vec<Plan>),
    /// Run `next` if `step` succeeds
    OnSuccess(HookPlan),
    /// Run `next` if `step` fails
    OnFailure(HookPlan),
    /// Run `next` if `step` is aborted
    OnAbort(HookPlan),
    /// Run `next` if `step` errors
    OnError(HookPlan),
    /// Always run `next` after `step`
    Ensure(HookPlan),
    /// Configure a pipeline from a file
    SetPipeline(SetPipelinePlan),
    /// Bind a build variable from a file
    LoadVar(LoadVarPlan),
}

impl Plan {
    /// Short lowercase name of the node's variant
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            PlanKind::Task(_) => "task",
            PlanKind::Check(_) => "check",
            PlanKind::Get(_) => "get",
            PlanKind::Put(_) => "put",
            PlanKind::Do(_) => "do",
            PlanKind::Aggregate(_) => "aggregate",
            PlanKind::InParallel(_) => "in_parallel",
            PlanKind::Across(_) => "across",
            PlanKind::Try(_) => "try",
            PlanKind::Timeout(_) => "timeout",
            PlanKind::Retry(_) => "retry",
            PlanKind::OnSuccess(_) => "on_success",
            PlanKind::OnFailure(_) => "on_failure",
            PlanKind::OnAbort(_) => "on_abort",
            PlanKind::OnError(_) => "on_error",
            PlanKind::Ensure(_) => "ensure",
            PlanKind::SetPipeline(_) => "set_pipeline",
            PlanKind::LoadVar(_) => "load_var",
        }
    }

    /// Direct children of this node, in declared order
    #[must_use]
    pub fn children(&self) -> Vec<&Plan> {
        match &self.kind {
            PlanKind::Do(plans) | PlanKind::Aggregate(plans) | PlanKind::Retry(plans) => {
                plans.iter().collect()
            }
            PlanKind::InParallel(parallel) => parallel.steps.iter().collect(),
            PlanKind::Across(across) => across.steps.iter().map(|scoped| &scoped.step).collect(),
            PlanKind::Try(TryPlan { step }) | PlanKind::Timeout(TimeoutPlan { step, .. }) => {
                vec![step.as_ref()]
            }
            PlanKind::OnSuccess(hook)
            | PlanKind::OnFailure(hook)
            | PlanKind::OnAbort(hook)
            | PlanKind::OnError(hook)
            | PlanKind::Ensure(hook) => vec![hook.step.as_ref(), hook.next.as_ref()],
            PlanKind::Task(_)
            | PlanKind::Check(_)
            | PlanKind::Get(_)
            | PlanKind::Put(_)
            | PlanKind::SetPipeline(_)
            | PlanKind::LoadVar(_) => Vec::new(),
        }
    }

    /// Visits this node and every descendant, parents before children
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Plan)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    /// Finds the node with the given ID
    #[must_use]
    pub fn find(&self, id: &PlanId) -> Option<&Plan> {
        let mut found = None;
        self.walk(&mut |plan| {
            if found.is_none() && &plan.id == id {
                found = Some(plan);
            }
        });
        found
    }
}

/// Payload of a task node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Step name
    pub name: String,
    /// Run the container privileged
    #[serde(default)]
    pub privileged: bool,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Inline configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    /// Configuration file, `<artifact>/<path>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    /// Template variables for the configuration
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: Params,
    /// Param overrides
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Task input name to artifact name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Task output name to artifact name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
    /// Artifact holding the image to run on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_artifact_name: Option<String>,
    /// Custom types visible to the task's image resource
    #[serde(default, skip_serializing_if = "VersionedResourceTypes::is_empty")]
    pub resource_types: VersionedResourceTypes,
}

/// Payload of a check node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    /// Step name
    pub name: String,
    /// Catalog resource whose scope receives the versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Catalog resource type whose scope receives the versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Resource type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Artifact holding the image of a custom type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_artifact_name: Option<String>,
    /// Source configuration
    #[serde(default)]
    pub source: Source,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Check timeout; empty means the configured default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    /// Check interval; empty means the configured default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    /// Version to check from, overriding the scope's latest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<Version>,
    /// Manually triggered: run regardless of the interval
    #[serde(default)]
    pub skip_interval: bool,
    /// Custom types visible to the check
    #[serde(default, skip_serializing_if = "VersionedResourceTypes::is_empty")]
    pub resource_types: VersionedResourceTypes,
}

impl CheckPlan {
    /// Whether this check was scheduled by interval rather than on demand
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        !self.skip_interval
    }
}

/// Payload of a get node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    /// Step name; the fetched artifact is registered under it
    pub name: String,
    /// Catalog resource, when the get is backed by one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Resource type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Artifact holding the image of a custom type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_artifact_name: Option<String>,
    /// Source configuration
    #[serde(default)]
    pub source: Source,
    /// Fetch params
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Version to fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Node whose stored result holds the version to fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<PlanId>,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Custom types visible to the get
    #[serde(default, skip_serializing_if = "VersionedResourceTypes::is_empty")]
    pub resource_types: VersionedResourceTypes,
    /// Fetches the image of a custom type; the artifact is registered as an
    /// image of the enclosing scope rather than as a build artifact
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub image: bool,
}

/// Payload of a put node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    /// Step name
    pub name: String,
    /// Catalog resource receiving the produced version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Resource type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Artifact holding the image of a custom type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_artifact_name: Option<String>,
    /// Source configuration
    #[serde(default)]
    pub source: Source,
    /// Publish params
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Which artifacts to hand to the put
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<InputsConfig>,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Custom types visible to the put
    #[serde(default, skip_serializing_if = "VersionedResourceTypes::is_empty")]
    pub resource_types: VersionedResourceTypes,
}

/// Which artifacts a put receives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InputsConfig {
    /// Every artifact visible to the step
    #[default]
    All,
    /// Artifacts named as the leading path segment of a param value
    Detect,
    /// Exactly these artifacts
    Specified(Vec<String>),
}

impl Serialize for InputsConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Detect => serializer.serialize_str("detect"),
            Self::Specified(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputsConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Keyword(String),
            Names(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Keyword(keyword) if keyword == "all" => Ok(Self::All),
            Raw::Keyword(keyword) if keyword == "detect" => Ok(Self::Detect),
            Raw::Keyword(other) => Err(serde::de::Error::custom(format!(
                "unknown inputs keyword '{other}', expected 'all', 'detect' or a list"
            ))),
            Raw::Names(names) => Ok(Self::Specified(names)),
        }
    }
}

/// Payload of an in-parallel node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InParallelPlan {
    /// Children
    pub steps: Vec<Plan>,
    /// Maximum concurrently running children; 0 is unbounded
    #[serde(default)]
    pub limit: usize,
    /// Stop admitting children after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

/// Payload of an across node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcrossPlan {
    /// Loop variables, outermost first
    pub vars: Vec<AcrossVar>,
    /// One compiled step per combination, in product order
    pub steps: Vec<VarScopedPlan>,
    /// Stop admitting combinations after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

/// A loop variable of an across node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrossVar {
    /// Variable name
    pub var: String,
    /// Values the variable takes
    pub values: Vec<Value>,
    /// Concurrency for this variable; "all" is compiled to `values.len()`
    pub max_in_flight: usize,
}

/// A step compiled for one combination of loop values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarScopedPlan {
    /// The compiled step
    pub step: Plan,
    /// Values bound to the loop variables, in variable order
    pub values: Vec<Value>,
}

/// Payload of a try node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryPlan {
    /// Wrapped step
    pub step: Box<Plan>,
}

/// Payload of a timeout node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPlan {
    /// Duration string, e.g. `1h`
    pub duration: String,
    /// Wrapped step
    pub step: Box<Plan>,
}

/// Payload of every hook node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPlan {
    /// Primary step
    pub step: Box<Plan>,
    /// Hook step
    pub next: Box<Plan>,
}

impl HookPlan {
    /// Pairs a primary step with its hook
    #[must_use]
    pub fn new(step: Plan, next: Plan) -> Self {
        Self {
            step: Box::new(step),
            next: Box::new(next),
        }
    }
}

/// Payload of a set-pipeline node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetPipelinePlan {
    /// Pipeline name
    pub name: String,
    /// Pipeline file, `<artifact>/<path>`
    pub file: String,
    /// Target team; defaults to the build's team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Template variables
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: Params,
    /// Variable files, `<artifact>/<path>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub var_files: Vec<String>,
}

/// Payload of a load-var node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadVarPlan {
    /// Variable name
    pub name: String,
    /// File, `<artifact>/<path>`
    pub file: String,
    /// `json`, `yaml`, `yml`, `trim` or `raw`; inferred when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Skip redaction of the loaded value
    #[serde(default)]
    pub reveal: bool,
}

macro_rules! plan_kind_from {
    ($($payload:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for PlanKind {
                fn from(payload: $payload) -> Self {
                    Self::$variant(payload)
                }
            }
        )*
    };
}

plan_kind_from! {
    TaskPlan => Task,
    CheckPlan => Check,
    GetPlan => Get,
    PutPlan => Put,
    InParallelPlan => InParallel,
    AcrossPlan => Across,
    TryPlan => Try,
    TimeoutPlan => Timeout,
    SetPipelinePlan => SetPipeline,
    LoadVarPlan => LoadVar,
}
