//! Declarative step configuration.
//!
//! The tree users write in pipeline files. The planner compiles it into a
//! [`Plan`](crate::plan::Plan) tree.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::plan::InputsConfig;
use crate::resource::{Params, Version};
use crate::task::TaskConfig;

/// One node of a step configuration tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepConfig {
    /// Fetch a resource
    Get(GetStepConfig),
    /// Publish to a resource
    Put(PutStepConfig),
    /// Run a task
    Task(TaskStepConfig),
    /// Check a resource or resource type
    Check(CheckStepConfig),
    /// Configure a pipeline
    SetPipeline(SetPipelineStepConfig),
    /// Load a build variable from a file
    LoadVar(LoadVarStepConfig),
    /// Run steps in sequence
    Do(Vec<StepConfig>),
    /// Run steps concurrently
    Aggregate(Vec<StepConfig>),
    /// Run steps concurrently with a limit
    InParallel(InParallelConfig),
    /// Run a step per combination of values
    Across(AcrossConfig),
    /// Ignore a step's failure
    Try(Box<StepConfig>),
    /// Bound a step's duration
    Timeout(TimeoutConfig),
    /// Retry a failing step
    Retry(RetryConfig),
    /// Hook run on success
    OnSuccess(HookConfig),
    /// Hook run on failure
    OnFailure(HookConfig),
    /// Hook run on abort
    OnAbort(HookConfig),
    /// Hook run on error
    OnError(HookConfig),
    /// Hook always run
    Ensure(HookConfig),
}

/// `get` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetStepConfig {
    /// Step name, also the artifact name
    pub name: String,
    /// Resource to fetch; defaults to the step name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Fetch params
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Worker tags; default to the resource's tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// `put` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutStepConfig {
    /// Step name
    pub name: String,
    /// Resource to publish to; defaults to the step name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Publish params
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Params of the implicit get after the put
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub get_params: Params,
    /// Artifacts handed to the put
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<InputsConfig>,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// `task` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStepConfig {
    /// Step name
    pub name: String,
    /// Run privileged
    #[serde(default)]
    pub privileged: bool,
    /// Inline configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    /// Configuration file, `<artifact>/<path>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Template variables
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: Params,
    /// Param overrides
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Task input name to artifact name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Task output name to artifact name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
    /// Artifact to use as the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// `check` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckStepConfig {
    /// Step name; names the resource unless `resource` or `resource_type` is set
    pub name: String,
    /// Resource to check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Resource type to check instead of a resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Check timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Check interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Version to check from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<Version>,
    /// Run regardless of the interval
    #[serde(default)]
    pub skip_interval: bool,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// `set_pipeline` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetPipelineStepConfig {
    /// Pipeline name
    pub name: String,
    /// Pipeline file, `<artifact>/<path>`
    pub file: String,
    /// Target team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Template variables
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: Params,
    /// Variable files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub var_files: Vec<String>,
}

/// `load_var` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadVarStepConfig {
    /// Variable name
    pub name: String,
    /// File, `<artifact>/<path>`
    pub file: String,
    /// File format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Do not redact the value
    #[serde(default)]
    pub reveal: bool,
}

/// `in_parallel` step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InParallelConfig {
    /// Children
    pub steps: Vec<StepConfig>,
    /// Maximum concurrently running children; 0 is unbounded
    #[serde(default)]
    pub limit: usize,
    /// Stop admitting children after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

/// `across` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrossConfig {
    /// Loop variables, outermost first
    pub vars: Vec<AcrossVarConfig>,
    /// Step run per combination
    pub step: Box<StepConfig>,
    /// Stop admitting combinations after the first failure
    #[serde(default)]
    pub fail_fast: bool,
}

/// One loop variable of an `across` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrossVarConfig {
    /// Variable name
    pub var: String,
    /// Values
    pub values: Vec<Value>,
    /// Concurrency for this variable; defaults to 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<MaxInFlight>,
}

/// Concurrency of an across variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxInFlight {
    /// Every value at once
    All,
    /// At most this many values at once
    Limit(usize),
}

impl MaxInFlight {
    /// Resolves the concurrency for a variable with `value_count` values
    #[must_use]
    pub fn resolve(self, value_count: usize) -> usize {
        match self {
            Self::All => value_count,
            Self::Limit(limit) => limit,
        }
    }
}

impl Serialize for MaxInFlight {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Limit(limit) => serializer.serialize_u64(*limit as u64),
        }
    }
}

impl<'de> Deserialize<'de> for MaxInFlight {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Limit(usize),
            Keyword(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Limit(limit) => Ok(Self::Limit(limit)),
            Raw::Keyword(keyword) if keyword == "all" => Ok(Self::All),
            Raw::Keyword(other) => Err(serde::de::Error::custom(format!(
                "invalid max_in_flight '{other}', expected a number or 'all'"
            ))),
        }
    }
}

/// `timeout` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Duration string
    pub duration: String,
    /// Wrapped step
    pub step: Box<StepConfig>,
}

/// `retry` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of attempts
    pub attempts: usize,
    /// Retried step
    pub step: Box<StepConfig>,
}

/// Any hook step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Primary step
    pub step: Box<StepConfig>,
    /// Hook step
    pub hook: Box<StepConfig>,
}

impl HookConfig {
    /// Pairs a primary step with its hook
    #[must_use]
    pub fn new(step: StepConfig, hook: StepConfig) -> Self {
        Self {
            step: Box::new(step),
            hook: Box::new(hook),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_nested_yaml() {
        let config: StepConfig = serde_yaml::from_str(
            r"
do:
  - get: { name: repo }
  - on_failure:
      step:
        task: { name: unit, file: repo/ci/unit.yml }
      hook:
        put: { name: alert }
  - across:
      vars:
        - var: os
          values: [linux, darwin]
          max_in_flight: all
      step:
        task: { name: build, file: repo/ci/build.yml }
",
        )
        .expect("valid step config");

        let StepConfig::Do(steps) = config else {
            panic!("expected do");
        };
        assert_eq!(steps.len(), 3);
        assert!(matches!(&steps[1], StepConfig::OnFailure(_)));
        let StepConfig::Across(across) = &steps[2] else {
            panic!("expected across");
        };
        assert_eq!(across.vars[0].max_in_flight, Some(MaxInFlight::All));
    }

    #[test]
    fn max_in_flight_resolves_all_to_value_count() {
        assert_eq!(MaxInFlight::All.resolve(4), 4);
        assert_eq!(MaxInFlight::Limit(2).resolve(4), 2);
        assert!(serde_json::from_value::<MaxInFlight>(serde_json::json!("some")).is_err());
    }
}
