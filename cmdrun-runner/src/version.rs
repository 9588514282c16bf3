use cmdrun_core::{CommandRequest, ProcessState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::executor::ProcessRunner;

/// Outcome of running one tool with `--version`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionCheck {
    pub tool: String,
    pub expected: String,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub output: String,
    pub failure_reason: Option<String>,
}

impl VersionCheck {
    fn from_runner(runner: &ProcessRunner, expected: &str) -> Self {
        Self {
            tool: runner.request().executable.clone(),
            expected: expected.to_string(),
            state: runner.state(),
            exit_code: runner.return_code(),
            output: runner.output_text(),
            failure_reason: runner.report().failure_reason,
        }
    }

    /// Ran to completion, exited 0 and printed exactly the expected version
    pub fn passed(&self) -> bool {
        self.problem().is_none()
    }

    pub fn problem(&self) -> Option<String> {
        match self.state {
            ProcessState::FailedToStart => Some(format!(
                "failed to start: {}",
                self.failure_reason.as_deref().unwrap_or("unknown reason")
            )),
            ProcessState::TimedOut => Some("timed out".to_string()),
            ProcessState::NotStarted | ProcessState::Running => {
                Some(format!("did not finish ({})", self.state))
            }
            ProcessState::Finished if self.exit_code != Some(0) => Some(format!(
                "exited with code {}",
                self.exit_code.unwrap_or(-1)
            )),
            ProcessState::Finished if self.output != self.expected => Some(format!(
                "printed '{}', expected '{}'",
                self.output, self.expected
            )),
            ProcessState::Finished => None,
        }
    }
}

/// Request that asks `tool` for its version
pub fn version_request(tool: &str, timeout: Option<Duration>) -> CommandRequest {
    let request = CommandRequest::new(tool).arg("--version");
    match timeout {
        Some(timeout) => request.timeout(timeout),
        None => request,
    }
}

/// Run every request concurrently and compare each tool's output with
/// `expected`. Results come back in the order of `requests`.
pub async fn check_versions(requests: Vec<CommandRequest>, expected: &str) -> Vec<VersionCheck> {
    let mut set = JoinSet::new();
    let mut runners = Vec::with_capacity(requests.len());

    for (index, request) in requests.into_iter().enumerate() {
        let runner = Arc::new(ProcessRunner::new(request));
        runners.push(runner.clone());
        set.spawn(async move { (index, runner.run().await) });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Err(e))) => {
                warn!(tool = %runners[index].request().executable, error = %e, "Version check did not run");
            }
            Ok((_, Ok(_))) => {}
            Err(e) => warn!(error = %e, "Version check task failed"),
        }
    }

    let checks: Vec<VersionCheck> = runners
        .iter()
        .map(|runner| VersionCheck::from_runner(runner, expected))
        .collect();

    let failed = checks.iter().filter(|c| !c.passed()).count();
    info!(tools = checks.len(), failed, "Version checks completed");
    checks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(exit_code: i32, output: &str) -> VersionCheck {
        VersionCheck {
            tool: "opengrok-deploy".to_string(),
            expected: "1.2.3".to_string(),
            state: ProcessState::Finished,
            exit_code: Some(exit_code),
            output: output.to_string(),
            failure_reason: None,
        }
    }

    #[test]
    fn test_version_request() {
        let request = version_request("opengrok-groups", Some(Duration::from_secs(5)));
        assert_eq!(request.executable, "opengrok-groups");
        assert_eq!(request.args, vec!["--version"]);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(version_request("opengrok", None).timeout, None);
    }

    #[test]
    fn test_version_check_passes_on_exact_output() {
        assert!(finished(0, "1.2.3").passed());
    }

    #[test]
    fn test_version_check_problems() {
        assert_eq!(
            finished(0, "opengrok 1.2.3").problem().unwrap(),
            "printed 'opengrok 1.2.3', expected '1.2.3'"
        );
        assert_eq!(
            finished(2, "1.2.3").problem().unwrap(),
            "exited with code 2"
        );

        let timed_out = VersionCheck {
            state: ProcessState::TimedOut,
            exit_code: None,
            ..finished(0, "")
        };
        assert_eq!(timed_out.problem().unwrap(), "timed out");

        let missing = VersionCheck {
            state: ProcessState::FailedToStart,
            exit_code: None,
            failure_reason: Some("not found".to_string()),
            ..finished(0, "")
        };
        assert_eq!(missing.problem().unwrap(), "failed to start: not found");
    }

    #[tokio::test]
    async fn test_check_versions_keeps_request_order() {
        let checks = check_versions(
            vec![
                version_request("nonexistent-tool-a", None),
                version_request("nonexistent-tool-b", None),
            ],
            "1.2.3",
        )
        .await;
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].tool, "nonexistent-tool-a");
        assert_eq!(checks[1].tool, "nonexistent-tool-b");
        assert!(checks.iter().all(|c| c.state == ProcessState::FailedToStart));
    }
}
