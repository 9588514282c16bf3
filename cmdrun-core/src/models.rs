use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CmdRunError, Result};

/// Default cap on bytes captured per output stream (64 MiB).
pub const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024 * 1024;

/// How request environment overrides combine with the caller's environment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    /// Overrides are layered on top of the inherited environment
    #[default]
    Inherit,
    /// Overrides are the whole environment of the child
    Clear,
}

/// A single external command invocation.
///
/// Built once by the caller and handed to a runner, which owns it for the
/// rest of its life.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub env_mode: EnvMode,
    pub timeout: Option<Duration>,
    pub redirect_stderr: bool,
    pub substitutions: BTreeMap<String, String>,
    pub log_output: bool,
    pub capture_limit: usize,
}

impl CommandRequest {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
            env_mode: EnvMode::Inherit,
            timeout: None,
            redirect_stderr: false,
            substitutions: BTreeMap::new(),
            log_output: false,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    /// Build a request from an argv-style list: the first element names the
    /// executable, the rest are its arguments.
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let executable = argv
            .next()
            .ok_or_else(|| CmdRunError::InvalidRequest("empty command line".to_string()))?;
        let request = Self::new(executable).args(argv);
        request.validate()?;
        Ok(request)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in envs {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.env_mode = EnvMode::Clear;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn redirect_stderr(mut self, redirect: bool) -> Self {
        self.redirect_stderr = redirect;
        self
    }

    /// Replace every occurrence of `pattern` in the arguments with `value`
    /// at launch time.
    pub fn substitute(mut self, pattern: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutions.insert(pattern.into(), value.into());
        self
    }

    pub fn log_output(mut self, log: bool) -> Self {
        self.log_output = log;
        self
    }

    pub fn capture_limit(mut self, bytes: usize) -> Self {
        self.capture_limit = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(CmdRunError::InvalidRequest(
                "executable name must not be empty".to_string(),
            ));
        }
        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(CmdRunError::InvalidRequest(
                "environment variable names must be non-empty and contain no '='".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(CmdRunError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Arguments as they will be handed to the process, substitutions applied
    pub fn resolved_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                self.substitutions
                    .iter()
                    .fold(arg.clone(), |acc, (pattern, value)| acc.replace(pattern, value))
            })
            .collect()
    }

    /// Value of `key` as the child will see it, if the request decides it
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

impl fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in self.resolved_args() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Coarse lifecycle state of a runner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    NotStarted,
    Running,
    Finished,
    FailedToStart,
    TimedOut,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Finished | ProcessState::FailedToStart | ProcessState::TimedOut
        )
    }

    fn rank(self) -> u8 {
        match self {
            ProcessState::NotStarted => 0,
            ProcessState::Running => 1,
            ProcessState::Finished | ProcessState::FailedToStart | ProcessState::TimedOut => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::NotStarted => "NOT_STARTED",
            ProcessState::Running => "RUNNING",
            ProcessState::Finished => "FINISHED",
            ProcessState::FailedToStart => "FAILED_TO_START",
            ProcessState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// Lifecycle state together with the data that is only meaningful in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Running {
        pid: Option<u32>,
    },
    /// The process exited on its own. `signal` is set when it was terminated
    /// by a signal, in which case `exit_code` is the negated signal number.
    Finished {
        exit_code: i32,
        signal: Option<i32>,
    },
    FailedToStart {
        reason: String,
    },
    TimedOut {
        timeout: Duration,
    },
}

impl ExecutionState {
    pub fn kind(&self) -> ProcessState {
        match self {
            ExecutionState::NotStarted => ProcessState::NotStarted,
            ExecutionState::Running { .. } => ProcessState::Running,
            ExecutionState::Finished { .. } => ProcessState::Finished,
            ExecutionState::FailedToStart { .. } => ProcessState::FailedToStart,
            ExecutionState::TimedOut { .. } => ProcessState::TimedOut,
        }
    }

    pub fn return_code(&self) -> Option<i32> {
        match self {
            ExecutionState::Finished { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExecutionState::Finished { signal, .. } => *signal,
            _ => None,
        }
    }
}

/// Serializable summary of one finished invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: Uuid,
    pub executable: String,
    pub args: Vec<String>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub pid: Option<u32>,
    pub failure_reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.state == ProcessState::Finished && self.exit_code == Some(0)
    }
}
