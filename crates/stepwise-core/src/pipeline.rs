//! Pipeline configuration as written by users and saved by `set_pipeline`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::resource::{Resource, ResourceType};
use crate::step_config::StepConfig;

/// A whole pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Declared resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    /// Declared custom resource types
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
    /// Jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobConfig>,
}

/// One job of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name
    pub name: String,
    /// Steps, run in sequence
    #[serde(default)]
    pub plan: Vec<StepConfig>,
}

/// A pipeline configuration failed validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid pipeline configuration: {}", .problems.join("; "))]
pub struct PipelineValidationError {
    /// Every problem found
    pub problems: Vec<String>,
}

impl PipelineConfig {
    /// Parses a pipeline file
    ///
    /// # Errors
    ///
    /// Returns the YAML error when the document is malformed.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Checks that resource, type and job names are unique
    ///
    /// # Errors
    ///
    /// Lists every duplicated name.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        let mut problems = Vec::new();
        find_duplicates("resource", self.resources.iter().map(|r| r.name.as_str()), &mut problems);
        find_duplicates(
            "resource type",
            self.resource_types.iter().map(|t| t.name.as_str()),
            &mut problems,
        );
        find_duplicates("job", self.jobs.iter().map(|j| j.name.as_str()), &mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PipelineValidationError { problems })
        }
    }
}

fn find_duplicates<'a>(kind: &str, names: impl Iterator<Item = &'a str>, problems: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            problems.push(format!("duplicate {kind} name '{name}'"));
        }
    }
}
