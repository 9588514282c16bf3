// Process-level primitives used by the runner: locating the executable,
// building the child command, draining its output and tearing it down.

use cmdrun_core::{CommandRequest, EnvMode};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long drain tasks may keep reading once the child is gone
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Reasons the operating system could not give us a running process
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable '{executable}' not found: {reason}")]
    NotFound { executable: String, reason: String },

    #[error("working directory '{}' does not exist or is not a directory", .0.display())]
    BadWorkingDirectory(PathBuf),

    #[error("failed to spawn '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Locate the program to run for `request`.
///
/// Bare names are looked up on the `PATH` the child would see. Names with a
/// path separator are taken as paths, relative ones against the working
/// directory.
pub fn resolve_program(request: &CommandRequest) -> Result<PathBuf, LaunchError> {
    let executable = &request.executable;
    let as_path = Path::new(executable);

    if as_path.components().count() > 1 || as_path.is_absolute() {
        return Ok(match &request.working_directory {
            Some(dir) if as_path.is_relative() => dir.join(as_path),
            _ => as_path.to_path_buf(),
        });
    }

    let search_path: Option<OsString> = match request.env_value("PATH") {
        Some(path) => Some(OsString::from(path)),
        None if request.env_mode == EnvMode::Clear => None,
        None => std::env::var_os("PATH"),
    };

    let cwd = match &request.working_directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    which::which_in(executable, search_path, cwd).map_err(|e| LaunchError::NotFound {
        executable: executable.clone(),
        reason: e.to_string(),
    })
}

pub fn check_working_directory(request: &CommandRequest) -> Result<(), LaunchError> {
    match &request.working_directory {
        Some(dir) if !dir.is_dir() => Err(LaunchError::BadWorkingDirectory(dir.clone())),
        _ => Ok(()),
    }
}

/// Build the child command. Arguments go to the program verbatim, no shell
/// is involved.
pub fn build_command(request: &CommandRequest, program: &Path) -> Command {
    let mut command = Command::new(program);
    command.args(request.resolved_args());

    if let Some(dir) = &request.working_directory {
        command.current_dir(dir);
    }

    if request.env_mode == EnvMode::Clear {
        command.env_clear();
    }
    command.envs(&request.env);

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so a timeout can take down every descendant
    #[cfg(unix)]
    command.process_group(0);

    command
}

pub fn spawn(mut command: Command, program: &Path) -> Result<Child, LaunchError> {
    command.spawn().map_err(|source| LaunchError::Spawn {
        program: program.to_path_buf(),
        source,
    })
}

/// Kill the child and everything in its process group, then reap it
pub async fn terminate_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg failed, falling back to killing the child");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already gone");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed child");
    }
}

/// Exit code and terminating signal of a finished child.
///
/// A child killed by a signal reports the negated signal number as its code.
pub fn exit_parts(status: ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (status.code().unwrap_or(-signal), Some(signal));
        }
    }
    (status.code().unwrap_or(-1), None)
}

/// Bounded byte sink shared between a drain task and the runner's accessors
#[derive(Debug)]
pub struct CaptureBuffer {
    bytes: Mutex<Vec<u8>>,
    limit: usize,
    truncated: AtomicBool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
            limit,
            truncated: AtomicBool::new(false),
        }
    }

    /// Append `chunk`, dropping whatever does not fit under the limit
    pub fn push(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let room = self.limit.saturating_sub(bytes.len());
        if chunk.len() > room {
            bytes.extend_from_slice(&chunk[..room]);
            if !self.truncated.swap(true, Ordering::Relaxed) {
                warn!(limit = self.limit, "Captured output exceeds limit, discarding the rest");
            }
        } else {
            bytes.extend_from_slice(chunk);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn text(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }
}

/// Read `reader` to end-of-file into `buffer`, chunk by chunk so partial
/// output is visible while the process is still running
pub async fn drain<R>(mut reader: R, buffer: std::sync::Arc<CaptureBuffer>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return Ok(()),
            Ok(n) => buffer.push(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// A running drain task and the stream it reads
pub struct DrainTask {
    pub stream: &'static str,
    pub handle: JoinHandle<io::Result<()>>,
}

/// Wait for every drain task to see end-of-file, giving up after `grace`.
///
/// Tasks still running at that point are aborted; what they captured so far
/// is kept. Returns false when any task had to be aborted.
pub async fn join_drains(tasks: Vec<DrainTask>, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    let mut complete = true;

    for DrainTask { stream, mut handle } in tasks {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(stream, error = %e, "Output capture ended with an error");
            }
            Ok(Err(e)) => {
                warn!(stream, error = %e, "Output capture task failed");
            }
            Err(_) => {
                handle.abort();
                complete = false;
                warn!(
                    stream,
                    grace_ms = grace.as_millis() as u64,
                    "Output stream still open after the process ended, abandoning capture"
                );
            }
        }
    }

    complete
}
