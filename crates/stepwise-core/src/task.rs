//! Task configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::resource::{Params, Source, Version};

/// What a task runs, on which image, with which inputs and outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Target platform, e.g. `linux`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Image fetched through a resource type before running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource: Option<ImageResource>,
    /// Raw image URI, used when no image resource is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_uri: Option<String>,
    /// Environment parameters
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// The process to run
    #[serde(default)]
    pub run: TaskRunConfig,
    /// Artifacts mounted into the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<TaskInputConfig>,
    /// Directories registered as artifacts after the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<TaskOutputConfig>,
}

/// An image obtained by fetching a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    /// Resource type used to fetch the image
    #[serde(rename = "type")]
    pub type_name: String,
    /// Source configuration
    #[serde(default)]
    pub source: Source,
    /// Fetch params
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Fixed version; checked when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// The process a task runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunConfig {
    /// Executable path
    #[serde(default)]
    pub path: String,
    /// Arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory, relative to the build directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// User to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A task input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInputConfig {
    /// Artifact name
    pub name: String,
    /// Mount path; defaults to the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Whether the task may run without this input
    #[serde(default)]
    pub optional: bool,
}

/// A task output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputConfig {
    /// Artifact name
    pub name: String,
    /// Directory path; defaults to the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A task configuration failed validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task configuration: {}", .problems.join("; "))]
pub struct TaskValidationError {
    /// Every problem found
    pub problems: Vec<String>,
}

impl TaskConfig {
    /// Parses a task configuration file
    ///
    /// # Errors
    ///
    /// Returns the YAML error when the document is malformed.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Overrides config params with step-level params
    pub fn override_params(&mut self, params: &Params) {
        for (key, value) in params {
            self.params.insert(key.clone(), value.clone());
        }
    }

    /// Checks the configuration is runnable
    ///
    /// # Errors
    ///
    /// Lists every problem found, not just the first.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        let mut problems = Vec::new();

        if self.platform.as_deref().is_none_or(str::is_empty) {
            problems.push("missing 'platform'".to_string());
        }
        if self.run.path.is_empty() {
            problems.push("missing path to executable to run".to_string());
        }

        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.name.as_str()) {
                problems.push(format!("duplicate input name '{}'", input.name));
            }
        }
        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.name.as_str()) {
                problems.push(format!("duplicate output name '{}'", output.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TaskValidationError { problems })
        }
    }
}
