//! Supervision of the single active encoder subprocess.
//!
//! [`ProcessSupervisor`] is a cheap clonable handle. The orchestrator's flow
//! starts and awaits processes through it while control surfaces (pause,
//! resume, cancel) reach the same active process through their own clones.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr};
use tracing::{debug, warn};

use crate::process_control::{platform_control, ProcessControl, ProcessTarget};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permission denied running {program}: {source}")]
    Permission {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("subprocess I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// The binary itself could not be run, as opposed to a stream failure.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, SupervisorError::Launch { .. } | SupervisorError::Permission { .. })
    }

    fn from_spawn(program: &Path, source: io::Error) -> Self {
        let program = program.to_path_buf();
        match source.kind() {
            io::ErrorKind::PermissionDenied => SupervisorError::Permission { program, source },
            _ => SupervisorError::Launch { program, source },
        }
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Killed on request or by a signal. Not a failure.
    Terminated,
    /// Nonzero exit code.
    Failed(i32),
}

/// Classify an exit status. `code` is `None` when the process died from a signal.
pub fn classify_exit(code: Option<i32>, kill_requested: bool) -> ExitOutcome {
    match code {
        Some(0) => ExitOutcome::Success,
        _ if kill_requested => ExitOutcome::Terminated,
        Some(c) if c < 0 => ExitOutcome::Terminated,
        Some(c) => ExitOutcome::Failed(c),
        None => ExitOutcome::Terminated,
    }
}

#[derive(Debug)]
struct ActiveProcess {
    target: ProcessTarget,
    kill_requested: bool,
}

struct SupervisorInner {
    active: Mutex<Option<ActiveProcess>>,
    control: Arc<dyn ProcessControl>,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("active", &*self.inner.active.lock())
            .finish()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(platform_control())
    }
}

impl ProcessSupervisor {
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                active: Mutex::new(None),
                control,
            }),
        }
    }

    /// Spawn `program` with `args`, capturing its diagnostic stream.
    ///
    /// The child runs in its own process group so terminal signals aimed at
    /// us do not reach it and a kill takes its descendants down too.
    pub fn start<I, S>(&self, program: &Path, args: I) -> Result<SupervisedProcess, SupervisorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::from_spawn(program, e))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not captured"))?;
        let target = process_target(&child)?;

        debug!(program = %program.display(), pid = target.pid, "Started subprocess");
        let previous = self.inner.active.lock().replace(ActiveProcess {
            target,
            kill_requested: false,
        });
        if let Some(previous) = previous {
            warn!(pid = previous.target.pid, "Previous subprocess was not retired before a new start");
        }

        Ok(SupervisedProcess {
            child,
            stderr: Some(stderr),
            lines: LineSplitter::default(),
            pid: target.pid,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Whether a process is currently tracked.
    pub fn is_active(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Suspend the active process. No-op when none is active.
    pub fn suspend(&self) {
        let active = self.inner.active.lock();
        if let Some(process) = active.as_ref() {
            if let Err(e) = self.inner.control.suspend(&process.target) {
                debug!(pid = process.target.pid, error = %e, "Suspend failed, process likely exited");
            }
        }
    }

    /// Resume the active process. No-op when none is active.
    pub fn resume(&self) {
        let active = self.inner.active.lock();
        if let Some(process) = active.as_ref() {
            if let Err(e) = self.inner.control.resume(&process.target) {
                debug!(pid = process.target.pid, error = %e, "Resume failed, process likely exited");
            }
        }
    }

    /// Forcefully terminate the active process tree. Errors are swallowed since
    /// racing a natural exit is expected.
    pub fn kill(&self) {
        let mut active = self.inner.active.lock();
        if let Some(process) = active.as_mut() {
            process.kill_requested = true;
            if let Err(e) = self.inner.control.terminate(&process.target) {
                debug!(pid = process.target.pid, error = %e, "Kill failed, process likely exited");
            }
        }
    }
}

#[cfg(windows)]
fn process_target(child: &Child) -> io::Result<ProcessTarget> {
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
    let handle = child.raw_handle().map(|h| h as usize).unwrap_or_default();
    Ok(ProcessTarget { pid, handle })
}

#[cfg(not(windows))]
fn process_target(child: &Child) -> io::Result<ProcessTarget> {
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
    Ok(ProcessTarget { pid, handle: 0 })
}

/// A running child owned by the orchestrator's flow.
pub struct SupervisedProcess {
    child: Child,
    stderr: Option<ChildStderr>,
    lines: LineSplitter,
    pid: u32,
    inner: Arc<SupervisorInner>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next line of diagnostic output; `None` once the process closes the stream.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Some(line);
            }
            let Some(stderr) = self.stderr.as_mut() else {
                return self.lines.finish();
            };
            let mut chunk = [0u8; READ_CHUNK];
            match stderr.read(&mut chunk).await {
                Ok(0) => self.stderr = None,
                Ok(n) => self.lines.push(&chunk[..n]),
                Err(e) => {
                    debug!(pid = self.pid, error = %e, "Diagnostic stream read failed");
                    self.stderr = None;
                }
            }
        }
    }

    /// Wait for exit and retire the process from the supervisor.
    pub async fn wait(mut self) -> Result<ExitOutcome, SupervisorError> {
        self.stderr = None;
        let status = self.child.wait().await;
        let kill_requested = self.retire();
        let status = status?;
        Ok(classify_exit(exit_code(&status), kill_requested))
    }

    /// Clear the supervisor slot if it still holds this process.
    fn retire(&self) -> bool {
        let mut active = self.inner.active.lock();
        match active.as_ref() {
            Some(process) if process.target.pid == self.pid => {
                active.take().map(|p| p.kill_requested).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.retire();
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// The encoder rewrites its status line in place with carriage returns, so
/// both count as terminators. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        (!text.is_empty()).then_some(text)
    }
}
