//! Launches one prepared execution and reports how it went.
//!
//! States: Preparing → InstallingDependencies (Python with dependencies
//! only) → Running → Completed | TimedOut | Failed. Failures after
//! preparation are reported through [`ExecutionResult`], never as `Err`.
//! Dependency installation and the run share one deadline.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::cache::{EnvCache, EnvLease};
use super::env::SecretEnv;
use super::process::{run_captured, ProcessError, Termination};
use super::resolver::ImportSearchPath;
use crate::bundle::ScriptKind;
use crate::config::ExecutionConfig;

/// Exit code reported when the deadline was hit.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Exit code reported when the process could not be started at all.
pub const FAILURE_EXIT_CODE: i32 = -2;

/// Final state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionState {
    Preparing,
    InstallingDependencies,
    Running,
    Finished(Outcome),
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Preparing => write!(f, "preparing"),
            ExecutionState::InstallingDependencies => write!(f, "installing dependencies"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Finished(Outcome::Completed) => write!(f, "completed"),
            ExecutionState::Finished(Outcome::TimedOut) => write!(f, "timed out"),
            ExecutionState::Finished(Outcome::Failed) => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub timed_out: bool,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    /// RFC 3339 start time
    pub started_at: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Completed && self.exit_code == 0
    }
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub script: PathBuf,
    pub kind: ScriptKind,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub environment: SecretEnv,
    pub search_path: ImportSearchPath,
    /// Raw requirement strings; only honored for Python
    pub requirements: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct Runner {
    execution: ExecutionConfig,
    cache: Arc<EnvCache>,
}

impl Runner {
    pub fn new(execution: ExecutionConfig, cache: Arc<EnvCache>) -> Self {
        Self { execution, cache }
    }

    pub async fn execute(&self, invocation: Invocation) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let timeout = self.execution.timeout();
        let mut state = ExecutionState::Preparing;
        debug!("{} is {state}", invocation.script.display());

        let mut lease = None;
        if invocation.kind == ScriptKind::Python && !invocation.requirements.is_empty() {
            transition(&invocation, &mut state, ExecutionState::InstallingDependencies);
            match tokio::time::timeout(timeout, self.cache.acquire(&invocation.requirements)).await {
                Ok(Ok(acquired)) => lease = Some(acquired),
                Ok(Err(e)) => {
                    let message = format!("Dependency installation failed: {e}");
                    return self.failed(&invocation, &mut state, message, clock, started_at);
                }
                Err(_) => {
                    let message = format!(
                        "Dependency installation did not finish within {}s",
                        timeout.as_secs()
                    );
                    return self.failed(&invocation, &mut state, message, clock, started_at);
                }
            }
        }

        let command = match self.build_command(&invocation, lease.as_ref()) {
            Ok(command) => command,
            Err(message) => return self.failed(&invocation, &mut state, message, clock, started_at),
        };

        // Installation time counts against the same deadline
        let remaining = timeout.saturating_sub(clock.elapsed());
        transition(&invocation, &mut state, ExecutionState::Running);
        let captured = match run_captured(command, remaining, self.execution.max_output_bytes).await {
            Ok(captured) => captured,
            Err(ProcessError::Spawn(e)) => {
                let message = format!("Failed to start {}: {e}", invocation.script.display());
                return self.failed(&invocation, &mut state, message, clock, started_at);
            }
            Err(ProcessError::Wait(e)) => {
                let message = format!(
                    "Lost track of {} while it was running: {e}",
                    invocation.script.display()
                );
                return self.failed(&invocation, &mut state, message, clock, started_at);
            }
        };
        drop(lease);

        let (outcome, exit_code) = match captured.termination {
            Termination::Exited(code) => (Outcome::Completed, code),
            Termination::Signaled(signal) => (Outcome::Completed, 128 + signal),
            Termination::TimedOut => (Outcome::TimedOut, TIMEOUT_EXIT_CODE),
        };
        transition(&invocation, &mut state, ExecutionState::Finished(outcome));
        if captured.truncated {
            warn!(
                "Output of {} exceeded {} bytes and was truncated",
                invocation.script.display(),
                self.execution.max_output_bytes
            );
        }
        info!(
            "{} finished: {state}, exit code {exit_code}",
            invocation.script.display()
        );

        ExecutionResult {
            exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            truncated: captured.truncated,
            timed_out: outcome == Outcome::TimedOut,
            outcome,
            warnings: invocation.warnings,
            duration_ms: elapsed_ms(clock),
            started_at: started_at.to_rfc3339(),
        }
    }

    fn build_command(
        &self,
        invocation: &Invocation,
        lease: Option<&EnvLease>,
    ) -> Result<Command, String> {
        let exec = &self.execution;
        let mut command = match invocation.kind {
            ScriptKind::Python => {
                let mut c = match lease {
                    Some(lease) => Command::new(lease.interpreter()),
                    None => Command::new(&exec.python),
                };
                c.arg(&invocation.script);
                c
            }
            ScriptKind::Shell => {
                let mut c = Command::new(&exec.bash);
                c.arg(&invocation.script);
                c
            }
            ScriptKind::JavaScript => {
                let mut c = Command::new(&exec.node);
                c.arg(&invocation.script);
                c
            }
            ScriptKind::Other => Command::new(&invocation.script),
        };

        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(invocation.environment.iter());

        if !invocation.search_path.roots().is_empty() {
            let value = invocation
                .search_path
                .to_env_value(std::env::var_os("PYTHONPATH"))
                .map_err(|e| e.to_string())?;
            command.env("PYTHONPATH", value);
        }
        command
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1");

        if let Some(lease) = lease {
            command.env("VIRTUAL_ENV", lease.env_dir());
            if let Some(bin) = lease.interpreter().parent() {
                let mut paths = vec![bin.to_path_buf()];
                if let Some(existing) = std::env::var_os("PATH") {
                    paths.extend(std::env::split_paths(&existing));
                }
                let joined: OsString = std::env::join_paths(paths).map_err(|e| e.to_string())?;
                command.env("PATH", joined);
            }
        }

        Ok(command)
    }

    fn failed(
        &self,
        invocation: &Invocation,
        state: &mut ExecutionState,
        message: String,
        clock: Instant,
        started_at: chrono::DateTime<Utc>,
    ) -> ExecutionResult {
        transition(invocation, state, ExecutionState::Finished(Outcome::Failed));
        warn!("{}: {message}", invocation.script.display());
        ExecutionResult {
            exit_code: FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: message,
            truncated: false,
            timed_out: false,
            outcome: Outcome::Failed,
            warnings: invocation.warnings.clone(),
            duration_ms: elapsed_ms(clock),
            started_at: started_at.to_rfc3339(),
        }
    }
}

fn transition(invocation: &Invocation, state: &mut ExecutionState, next: ExecutionState) {
    debug!(
        "{}: {} -> {}",
        invocation.script.display(),
        state,
        next
    );
    *state = next;
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}
