//! Integration tests for the `cmdrun` binary.

use assert_cmd::Command;
use cmdrun_core::{CommandRequest, ProcessState, VERSION};
use cmdrun_runner::ProcessRunner;
use predicates::prelude::*;
use std::io::Write;

fn cmdrun() -> Command {
    let mut cmd = Command::cargo_bin("cmdrun").unwrap();
    cmd.env_remove("CMDRUN_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn cmdrun_path() -> &'static str {
    env!("CARGO_BIN_EXE_cmdrun")
}

#[test]
fn test_version_flag_prints_exact_version() {
    cmdrun()
        .arg("--version")
        .assert()
        .success()
        .stdout(format!("{}\n", VERSION))
        .stderr("");
}

#[test]
fn test_version_through_process_runner() {
    let runner = ProcessRunner::new(CommandRequest::new(cmdrun_path()).arg("--version"));
    runner.execute().unwrap();

    assert_eq!(runner.return_code(), Some(0));
    assert_eq!(runner.state(), ProcessState::Finished);
    assert_eq!(runner.output_text(), VERSION);
}

#[test]
fn test_help() {
    cmdrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check-versions"));
}

#[test]
fn test_missing_subcommand_prints_help() {
    cmdrun().assert().code(2);
}

#[test]
fn test_exec_missing_tool() {
    cmdrun()
        .args(["exec", "--", "nonexistent-tool-xyz", "--version"])
        .assert()
        .code(127)
        .stderr(predicate::str::contains("nonexistent-tool-xyz"));
}

#[test]
fn test_exec_rejects_bad_env() {
    cmdrun()
        .args(["exec", "--env", "NOEQUALS", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}

#[test]
fn test_check_versions_needs_tools() {
    cmdrun()
        .arg("check-versions")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No tools"));
}

#[test]
fn test_check_versions_against_itself() {
    cmdrun()
        .args(["check-versions", cmdrun_path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"))
        .stdout(predicate::str::contains("0 failed"));
}

#[test]
fn test_check_versions_reports_mismatch() {
    cmdrun()
        .args(["check-versions", "--expect", "0.0.0-never", cmdrun_path()])
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAIL"))
        .stdout(predicate::str::contains("expected '0.0.0-never'"));
}

#[test]
fn test_check_versions_json() {
    let output = cmdrun()
        .args(["check-versions", "--format", "json", cmdrun_path(), "nonexistent-tool-xyz"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let checks: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(checks[0]["state"], "FINISHED");
    assert_eq!(checks[0]["output"], VERSION);
    assert_eq!(checks[1]["state"], "FAILED_TO_START");
}

#[test]
fn test_check_versions_uses_configured_tools() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "tools = [{:?}]", cmdrun_path()).unwrap();

    cmdrun()
        .args(["check-versions", "--config"])
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 tool(s) checked, 0 failed"));
}

#[test]
fn test_config_from_environment_variable() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "tools = [{:?}]", cmdrun_path()).unwrap();

    cmdrun()
        .env("CMDRUN_CONFIG", config.path())
        .arg("check-versions")
        .assert()
        .success();
}

#[test]
fn test_invalid_config_is_reported() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "unknown_key = true").unwrap();

    cmdrun()
        .args(["check-versions", "--config"])
        .arg(config.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration"));
}

#[test]
fn test_missing_config_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");

    cmdrun()
        .args(["check-versions", "--config"])
        .arg(&missing)
        .arg(cmdrun_path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration"))
        .stderr(predicate::str::contains("does not exist"));

    cmdrun()
        .env("CMDRUN_CONFIG", &missing)
        .args(["check-versions", cmdrun_path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_exec_rejects_out_of_range_timeout() {
    cmdrun()
        .args(["exec", "--timeout", "1e30", "--", "true"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("out of range"));
}

#[cfg(unix)]
mod unix {
    use super::*;

    #[test]
    fn test_exec_passes_output_and_exit_code_through() {
        cmdrun()
            .args(["exec", "--", "sh", "-c", "echo out; echo err >&2; exit 3"])
            .assert()
            .code(3)
            .stdout("out\n")
            .stderr(predicate::str::contains("err"));
    }

    #[test]
    fn test_exec_timeout() {
        cmdrun()
            .args(["exec", "--timeout", "0.5", "--", "sleep", "10"])
            .timeout(std::time::Duration::from_secs(10))
            .assert()
            .code(124)
            .stderr(predicate::str::contains("timed out"));
    }

    #[test]
    fn test_exec_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        cmdrun()
            .args(["exec", "--env", "GREETING=hello", "--cwd"])
            .arg(dir.path())
            .args(["--", "sh", "-c", "echo \"$GREETING\" > greeting.txt"])
            .assert()
            .success();

        let written = std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap();
        assert_eq!(written, "hello\n");
    }

    #[test]
    fn test_exec_json_report() {
        let output = cmdrun()
            .args(["exec", "--format", "json", "--", "sh", "-c", "printf 1.2.3"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["state"], "FINISHED");
        assert_eq!(report["exit_code"], 0);
        assert_eq!(report["stdout"], "1.2.3");
        assert_eq!(report["args"][0], "-c");
    }

    #[test]
    fn test_exec_merge_stderr() {
        cmdrun()
            .args(["exec", "--merge-stderr", "--", "sh", "-c", "echo only-err >&2"])
            .assert()
            .success()
            .stdout("only-err\n");
    }

    #[test]
    fn test_config_timeout_applies_to_exec() {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        writeln!(config, "default_timeout_secs = 0.5").unwrap();

        cmdrun()
            .args(["exec", "--config"])
            .arg(config.path())
            .args(["--", "sleep", "10"])
            .timeout(std::time::Duration::from_secs(10))
            .assert()
            .code(124);
    }
}
