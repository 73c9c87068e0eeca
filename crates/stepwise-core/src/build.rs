//! Build status and the metadata steps expose to containers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Created, not yet started
    Pending,
    /// Running
    Started,
    /// Root step succeeded
    Succeeded,
    /// Root step failed cleanly
    Failed,
    /// Root step raised an error
    Errored,
    /// Build was aborted
    Aborted,
}

impl BuildStatus {
    /// Whether the build has not reached a final status
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Pending | Self::Started)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Identity of the build a step runs in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    /// Build ID
    pub build_id: u64,
    /// Build name, e.g. `42`
    pub build_name: String,
    /// Owning team ID
    pub team_id: u64,
    /// Owning team name
    pub team_name: String,
    /// Pipeline ID, when the build belongs to a pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<u64>,
    /// Pipeline name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    /// Job name, for job builds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// URL of the web UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}

impl BuildMetadata {
    /// Environment variables describing the build, for resource scripts
    #[must_use]
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![
            format!("BUILD_ID={}", self.build_id),
            format!("BUILD_NAME={}", self.build_name),
            format!("BUILD_TEAM_ID={}", self.team_id),
            format!("BUILD_TEAM_NAME={}", self.team_name),
        ];
        if let Some(id) = self.pipeline_id {
            env.push(format!("BUILD_PIPELINE_ID={id}"));
        }
        if let Some(name) = &self.pipeline_name {
            env.push(format!("BUILD_PIPELINE_NAME={name}"));
        }
        if let Some(name) = &self.job_name {
            env.push(format!("BUILD_JOB_NAME={name}"));
        }
        if let Some(url) = &self.external_url {
            env.push(format!("ATC_EXTERNAL_URL={url}"));
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn final_statuses_are_not_running() {
        assert!(BuildStatus::Started.is_running());
        assert!(!BuildStatus::Aborted.is_running());
        assert_eq!(BuildStatus::Errored.to_string(), "errored");
    }

    #[test]
    fn env_skips_missing_fields() {
        let metadata = BuildMetadata {
            build_id: 7,
            build_name: "3".into(),
            team_id: 1,
            team_name: "main".into(),
            job_name: Some("unit".into()),
            ..BuildMetadata::default()
        };
        assert_eq!(
            metadata.env(),
            vec![
                "BUILD_ID=7",
                "BUILD_NAME=3",
                "BUILD_TEAM_ID=1",
                "BUILD_TEAM_NAME=main",
                "BUILD_JOB_NAME=unit"
            ]
        );
    }
}
