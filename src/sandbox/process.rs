//! Child process handling: capped output capture and deadline enforcement.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for the pipes to close once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const CHUNK_SIZE: usize = 8 * 1024;

/// Byte buffer that keeps at most `cap` bytes and remembers if more came.
#[derive(Debug, Default)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let take = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Decodes the kept bytes without ever exceeding the cap. A multibyte
    /// character cut by the cap is dropped instead of becoming U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        let mut data = self.data.as_slice();
        if self.truncated {
            if let Err(e) = std::str::from_utf8(data) {
                if e.error_len().is_none() {
                    data = &data[..e.valid_up_to()];
                }
            }
        }

        let mut text = String::from_utf8_lossy(data).into_owned();
        if text.len() > self.cap {
            let mut end = self.cap;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        text
    }
}

/// Why a child could not be run to completion.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed while waiting for exit: {0}")]
    Wait(#[source] std::io::Error),
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    /// Killed by a signal it did not handle (unix)
    Signaled(i32),
    /// Deadline hit; the process group was killed
    TimedOut,
}

#[derive(Debug)]
pub struct CapturedOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub pid: Option<u32>,
}

/// A spawned child with its output being drained in the background.
///
/// Dropping it before [`RunningProcess::wait`] returns kills the whole
/// process group, not only the direct child.
pub struct RunningProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Drain,
    stderr: Drain,
    reaped: bool,
}

struct Drain {
    buffer: Arc<Mutex<CappedBuffer>>,
    task: JoinHandle<()>,
}

impl Drain {
    fn start<R>(reader: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut reader) = reader else { return };
            let mut chunk = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    // Keep reading past the cap so the child never blocks
                    Ok(n) => lock(&sink).push(&chunk[..n]),
                    Err(e) => {
                        debug!("Output pipe closed with error: {e}");
                        break;
                    }
                }
            }
        });
        Self { buffer, task }
    }

    /// Waits briefly for EOF; returns whether the pipe actually closed.
    async fn finish(&mut self) -> bool {
        match tokio::time::timeout(DRAIN_GRACE, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                self.task.abort();
                false
            }
        }
    }
}

fn lock(buffer: &Mutex<CappedBuffer>) -> std::sync::MutexGuard<'_, CappedBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunningProcess {
    /// Spawns `command` with null stdin, piped output, and (on unix) its
    /// own process group so the whole tree can be killed together.
    pub fn spawn(mut command: Command, max_output: usize) -> Result<Self, ProcessError> {
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id();
        let stdout = Drain::start(child.stdout.take(), max_output);
        let stderr = Drain::start(child.stderr.take(), max_output);
        debug!("Spawned child process {pid:?}");

        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            reaped: false,
        })
    }

    /// Waits for exit or the deadline, whichever comes first.
    pub async fn wait(mut self, deadline: Duration) -> Result<CapturedOutput, ProcessError> {
        let termination = match tokio::time::timeout(deadline, self.child.wait()).await {
            Ok(Ok(status)) => termination_of(status),
            Ok(Err(e)) => {
                warn!("Lost track of child {:?}: {e}", self.pid);
                self.kill().await;
                self.reaped = true;
                return Err(ProcessError::Wait(e));
            }
            Err(_) => {
                warn!(
                    "Child {:?} exceeded {}s, killing its process group",
                    self.pid,
                    deadline.as_secs_f64()
                );
                self.kill().await;
                Termination::TimedOut
            }
        };

        let stdout_closed = self.stdout.finish().await;
        let stderr_closed = self.stderr.finish().await;
        if !(stdout_closed && stderr_closed) {
            // Descendants still hold the pipes open
            debug!("Pipes of {:?} still open after exit, killing group", self.pid);
            kill_group(self.pid);
        }
        self.reaped = true;

        let stdout = lock(&self.stdout.buffer);
        let stderr = lock(&self.stderr.buffer);
        Ok(CapturedOutput {
            termination,
            stdout: stdout.to_string_lossy(),
            stderr: stderr.to_string_lossy(),
            truncated: stdout.truncated() || stderr.truncated(),
            pid: self.pid,
        })
    }

    /// Forcefully terminates the process group and reaps the child.
    pub async fn kill(&mut self) {
        kill_group(self.pid);
        if let Err(e) = self.child.start_kill() {
            debug!("start_kill on {:?}: {e}", self.pid);
        }
        if let Err(e) = self.child.wait().await {
            warn!("Failed to reap child {:?}: {e}", self.pid);
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if !self.reaped {
            debug!("Child {:?} dropped while running, killing its group", self.pid);
            kill_group(self.pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("killpg({pid}) failed: {e}");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn termination_of(status: std::process::ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Exited(-1)
}

/// Spawns and waits in one step.
pub async fn run_captured(
    command: Command,
    deadline: Duration,
    max_output: usize,
) -> Result<CapturedOutput, ProcessError> {
    RunningProcess::spawn(command, max_output)?.wait(deadline).await
}
