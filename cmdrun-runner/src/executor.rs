use chrono::{DateTime, Utc};
use cmdrun_core::{
    CmdRunError, CommandRequest, ExecutionReport, ExecutionState, ProcessState, Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::process::{self, CaptureBuffer, DrainTask, DRAIN_GRACE};

#[derive(Debug)]
struct Progress {
    state: ExecutionState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    elapsed: Option<Duration>,
    pid: Option<u32>,
}

/// Launches one external process and reports its terminal outcome.
///
/// A runner is bound to a single [`CommandRequest`] and runs it at most once.
/// Launch failures, non-zero exits and timeouts all end up in the runner's
/// state; inspect it through the accessors after [`execute`](Self::execute)
/// returns. Accessors may also be called from other threads while the process
/// runs and then return whatever has been captured so far.
#[derive(Debug)]
pub struct ProcessRunner {
    id: Uuid,
    request: CommandRequest,
    executed: AtomicBool,
    progress: Mutex<Progress>,
    stdout: Arc<CaptureBuffer>,
    stderr: Arc<CaptureBuffer>,
}

impl ProcessRunner {
    pub fn new(request: CommandRequest) -> Self {
        let limit = request.capture_limit;
        Self {
            id: Uuid::new_v4(),
            request,
            executed: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                state: ExecutionState::NotStarted,
                started_at: None,
                finished_at: None,
                started: None,
                elapsed: None,
                pid: None,
            }),
            stdout: Arc::new(CaptureBuffer::new(limit)),
            stderr: Arc::new(CaptureBuffer::new(limit)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &CommandRequest {
        &self.request
    }

    /// Run the process to a terminal state, blocking the calling thread.
    ///
    /// Drives [`run`](Self::run) on a private single-threaded runtime, so it
    /// must not be called from within an async context.
    ///
    /// # Errors
    ///
    /// Only misuse is reported as an error: a second call on the same runner,
    /// a call from inside a Tokio runtime, or failure to build the runtime.
    /// Everything that happens to the external process is reported through
    /// [`state`](Self::state).
    pub fn execute(&self) -> Result<ProcessState> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(CmdRunError::ExecutionError(
                "execute() blocks and cannot be called from an async context, use run()"
                    .to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run())
    }

    /// Async counterpart of [`execute`](Self::execute)
    pub async fn run(&self) -> Result<ProcessState> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(CmdRunError::AlreadyExecuted(self.request.executable.clone()));
        }

        self.start();

        if let Err(e) = self.request.validate() {
            return Ok(self.fail_to_start(e.to_string()));
        }

        let program = match process::check_working_directory(&self.request)
            .and_then(|()| process::resolve_program(&self.request))
        {
            Ok(program) => program,
            Err(e) => return Ok(self.fail_to_start(e.to_string())),
        };

        let command = process::build_command(&self.request, &program);
        let mut child = match process::spawn(command, &program) {
            Ok(child) => child,
            Err(e) => return Ok(self.fail_to_start(e.to_string())),
        };

        let pid = child.id();
        self.set_pid(pid);
        info!(
            runner_id = %self.id,
            executable = %self.request.executable,
            program = %program.display(),
            pid = ?pid,
            "Process started"
        );

        let stderr_sink = if self.request.redirect_stderr {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        };

        let mut drains = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            drains.push(DrainTask {
                stream: "stdout",
                handle: tokio::spawn(process::drain(out, self.stdout.clone())),
            });
        }
        if let Some(err) = child.stderr.take() {
            drains.push(DrainTask {
                stream: "stderr",
                handle: tokio::spawn(process::drain(err, stderr_sink)),
            });
        }

        let waited = match self.request.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await,
            None => Ok(child.wait().await),
        };

        let next = match waited {
            Ok(Ok(status)) => {
                let (exit_code, signal) = process::exit_parts(status);
                process::join_drains(drains, DRAIN_GRACE).await;
                ExecutionState::Finished { exit_code, signal }
            }
            Ok(Err(e)) => {
                error!(runner_id = %self.id, error = %e, "Failed to wait for process");
                process::terminate_tree(&mut child, pid).await;
                process::join_drains(drains, DRAIN_GRACE).await;
                ExecutionState::Finished {
                    exit_code: -1,
                    signal: None,
                }
            }
            Err(_elapsed) => {
                let timeout = self.request.timeout.unwrap_or_default();
                warn!(
                    runner_id = %self.id,
                    executable = %self.request.executable,
                    pid = ?pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Process timed out, terminating"
                );
                process::terminate_tree(&mut child, pid).await;
                process::join_drains(drains, DRAIN_GRACE).await;
                ExecutionState::TimedOut { timeout }
            }
        };

        Ok(self.finish(next))
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.progress().state.kind()
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.progress().state.clone()
    }

    /// Exit code of the process; `None` unless the state is `Finished`
    pub fn return_code(&self) -> Option<i32> {
        self.progress().state.return_code()
    }

    /// Signal that terminated the process, if it was not a normal exit
    pub fn signal(&self) -> Option<i32> {
        self.progress().state.signal()
    }

    pub fn pid(&self) -> Option<u32> {
        self.progress().pid
    }

    /// Time spent running so far, or in total once terminal
    pub fn elapsed(&self) -> Option<Duration> {
        let progress = self.progress();
        progress
            .elapsed
            .or_else(|| progress.started.map(|started| started.elapsed()))
    }

    /// Captured standard output without its trailing line terminator
    pub fn output_text(&self) -> String {
        self.stdout
            .text()
            .trim_end_matches(['\n', '\r'])
            .to_string()
    }

    pub fn raw_output(&self) -> Vec<u8> {
        self.stdout.snapshot()
    }

    pub fn output_lines(&self) -> Vec<String> {
        self.stdout.text().lines().map(str::to_string).collect()
    }

    /// Captured standard error; empty when stderr is redirected to stdout
    pub fn error_text(&self) -> String {
        self.stderr.text()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.stderr.text().lines().map(str::to_string).collect()
    }

    /// Whether either stream hit the capture limit
    pub fn output_truncated(&self) -> bool {
        self.stdout.truncated() || self.stderr.truncated()
    }

    pub fn report(&self) -> ExecutionReport {
        let progress = self.progress();
        let failure_reason = match &progress.state {
            ExecutionState::FailedToStart { reason } => Some(reason.clone()),
            _ => None,
        };

        ExecutionReport {
            id: self.id,
            executable: self.request.executable.clone(),
            args: self.request.resolved_args(),
            state: progress.state.kind(),
            exit_code: progress.state.return_code(),
            signal: progress.state.signal(),
            pid: progress.pid,
            failure_reason,
            stdout: self.stdout.text(),
            stderr: self.stderr.text(),
            started_at: progress.started_at,
            finished_at: progress.finished_at,
            duration_ms: progress.elapsed.map(|d| d.as_millis() as u64),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) {
        let mut progress = self.progress();
        progress.started_at = Some(Utc::now());
        progress.started = Some(Instant::now());
        Self::transition(&mut progress, ExecutionState::Running { pid: None });
        debug!(runner_id = %self.id, command = %self.request, "Launching process");
    }

    fn set_pid(&self, pid: Option<u32>) {
        let mut progress = self.progress();
        progress.pid = pid;
        if let ExecutionState::Running { pid: current } = &mut progress.state {
            *current = pid;
        }
    }

    fn fail_to_start(&self, reason: String) -> ProcessState {
        error!(
            runner_id = %self.id,
            executable = %self.request.executable,
            reason = %reason,
            "Process failed to start"
        );
        self.finish(ExecutionState::FailedToStart { reason })
    }

    fn finish(&self, next: ExecutionState) -> ProcessState {
        let state = {
            let mut progress = self.progress();
            progress.finished_at = Some(Utc::now());
            progress.elapsed = progress.started.map(|started| started.elapsed());
            Self::transition(&mut progress, next);

            info!(
                runner_id = %self.id,
                executable = %self.request.executable,
                state = %progress.state.kind(),
                exit_code = ?progress.state.return_code(),
                duration_ms = ?progress.elapsed.map(|d| d.as_millis() as u64),
                "Process execution completed"
            );
            progress.state.kind()
        };

        if self.request.log_output {
            self.log_captured_output();
        }

        state
    }

    fn transition(progress: &mut Progress, next: ExecutionState) {
        let (from, to) = (progress.state.kind(), next.kind());
        if from.can_transition_to(to) {
            progress.state = next;
        } else {
            // Unreachable through the public API: run() is guarded to a single pass
            error!(%from, %to, "Ignoring out-of-order state transition");
        }
    }

    fn log_captured_output(&self) {
        let executable = &self.request.executable;
        for line in self.output_lines() {
            debug!(executable = %executable, stream = "stdout", "{}", line);
        }
        for line in self.error_lines() {
            debug!(executable = %executable, stream = "stderr", "{}", line);
        }
    }
}
