use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use stepwise_core::plan::LoadVarPlan;

use super::{read_file, report_error, Outcome};
use crate::context::StepContext;
use crate::delegate::BuildStepDelegate;
use crate::run_state::RunState;
use crate::step::Step;
use crate::worker::WorkerClient;
use crate::{ExecErrorKind, ExecResult};

/// Loads a file from an artifact into a local build variable
pub struct LoadVarStep {
    plan: LoadVarPlan,
    worker: Arc<dyn WorkerClient>,
    delegate: Arc<dyn BuildStepDelegate>,
    outcome: Outcome,
}

impl LoadVarStep {
    /// Creates a load-var step
    pub fn new(plan: LoadVarPlan, worker: Arc<dyn WorkerClient>, delegate: Arc<dyn BuildStepDelegate>) -> Self {
        Self {
            plan,
            worker,
            delegate,
            outcome: Outcome::default(),
        }
    }

    /// The explicit format, else one inferred from the file extension
    fn format(&self) -> &str {
        if let Some(format) = &self.plan.format {
            return format;
        }
        match self.plan.file.rsplit_once('.').map(|(_, extension)| extension) {
            Some("json") => "json",
            Some("yaml" | "yml") => "yaml",
            _ => "trim",
        }
    }

    fn parse(&self, bytes: &[u8]) -> ExecResult<Value> {
        let format = self.format();
        let invalid = |reason: String| ExecErrorKind::ParseFile {
            file: self.plan.file.clone(),
            format: format.to_string(),
            reason,
        };
        match format {
            "json" => serde_json::from_slice(bytes).map_err(|err| invalid(err.to_string()).into()),
            "yaml" | "yml" => serde_yaml::from_slice(bytes).map_err(|err| invalid(err.to_string()).into()),
            "trim" => Ok(Value::String(String::from_utf8_lossy(bytes).trim().to_string())),
            "raw" => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
            other => Err(invalid(format!("unknown format '{other}'")).into()),
        }
    }

    async fn load(&self, ctx: &StepContext, state: &Arc<RunState>) -> ExecResult<bool> {
        self.delegate.initializing();

        let bytes = read_file(ctx, self.worker.as_ref(), state, &self.plan.file).await?;
        let value = self.parse(&bytes)?;
        state.vars().set_local(self.plan.name.clone(), value, !self.plan.reveal);
        tracing::debug!(var = %self.plan.name, file = %self.plan.file, "loaded var");

        self.delegate.starting();
        self.delegate.finished(true);
        Ok(true)
    }
}

#[async_trait]
impl Step for LoadVarStep {
    async fn run(&self, ctx: StepContext, state: Arc<RunState>) -> ExecResult<bool> {
        let result = self.load(&ctx, &state).await;
        report_error(self.delegate.as_ref(), &result);
        self.outcome.record(&result);
        result
    }

    fn succeeded(&self) -> bool {
        self.outcome.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::VolumeArtifact;
    use crate::steps::testing::{events, state, FakeWorker};
    use crate::vars::RedactionTracker;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use stepwise_events::InMemoryEventStore;

    async fn load(file: &str, content: &str, format: Option<&str>, reveal: bool) -> (ExecResult<bool>, Arc<RunState>) {
        let path = file.split_once('/').map(|(_, path)| path).unwrap_or_default();
        let worker = Arc::new(FakeWorker::default().with_file(path, content));
        let state = state();
        state
            .artifacts()
            .register_artifact("out", Arc::new(VolumeArtifact::new("vol-out")));
        let step = LoadVarStep::new(
            LoadVarPlan {
                name: "loaded".into(),
                file: file.into(),
                format: format.map(str::to_string),
                reveal,
            },
            worker,
            Arc::new(events(&Arc::new(InMemoryEventStore::new()), "6")),
        );
        let result = step.run(StepContext::background(), state.clone()).await;
        (result, state)
    }

    #[rstest]
    #[case::json_by_extension("out/version.json", "{\"ref\": \"abc\"}", None, json!({"ref": "abc"}))]
    #[case::yaml_by_extension("out/version.yml", "ref: abc\n", None, json!({"ref": "abc"}))]
    #[case::trimmed_by_default("out/version", "  abc \n", None, json!("abc"))]
    #[case::raw("out/version", "  abc \n", Some("raw"), json!("  abc \n"))]
    #[case::explicit_json("out/version.txt", "[1, 2]", Some("json"), json!([1, 2]))]
    #[tokio::test]
    async fn parses_by_format(
        #[case] file: &str,
        #[case] content: &str,
        #[case] format: Option<&str>,
        #[case] expected: Value,
    ) {
        let (result, state) = load(file, content, format, true).await;
        assert!(result.unwrap());
        assert_eq!(state.vars().local("loaded"), Some(expected));
    }

    #[tokio::test]
    async fn loaded_values_are_redacted_unless_revealed() {
        let (_, state) = load("out/token", "s3cret\n", None, false).await;
        let tracker: &Arc<RedactionTracker> = state.vars().tracker();
        assert_eq!(tracker.redact("token is s3cret"), "token is ((redacted))");

        let (_, state) = load("out/token", "visible\n", None, true).await;
        assert_eq!(state.vars().tracker().redact("token is visible"), "token is visible");
    }

    #[tokio::test]
    async fn malformed_content_is_an_error() {
        let (result, _) = load("out/version.json", "{not json", None, true).await;
        let err = result.unwrap_err();
        assert!(matches!(err.kind(), ExecErrorKind::ParseFile { format, .. } if format == "json"));

        let (result, _) = load("out/version", "abc", Some("toml"), true).await;
        assert!(matches!(result.unwrap_err().kind(), ExecErrorKind::ParseFile { .. }));
    }
}
