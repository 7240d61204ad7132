//! Dependency installation into isolated virtual environments.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Why an environment could not be prepared.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("failed to launch installer '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("installer exited with {status}: {diagnostic}")]
    Failed { status: String, diagnostic: String },

    #[error("cannot prepare environment directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates a virtual environment and installs requirements into it.
///
/// The cache calls `install` at most once per dependency set; an
/// implementation does not need to handle concurrency itself.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Populates `target` (an empty directory) with an environment holding
    /// `requirements`.
    async fn install(&self, target: &Path, requirements: &[String]) -> Result<(), InstallError>;

    /// Interpreter inside an environment created by this installer.
    fn interpreter(&self, target: &Path) -> PathBuf {
        venv_interpreter(target)
    }
}

/// Standard virtualenv interpreter location.
pub fn venv_interpreter(target: &Path) -> PathBuf {
    if cfg!(windows) {
        target.join("Scripts").join("python.exe")
    } else {
        target.join("bin").join("python")
    }
}

/// Installs with `uv`: `uv venv` then `uv pip install` into that venv.
#[derive(Debug, Clone)]
pub struct UvInstaller {
    program: String,
    python: String,
}

impl UvInstaller {
    pub fn new(program: impl Into<String>, python: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            python: python.into(),
        }
    }

    async fn step(&self, mut command: Command) -> Result<(), InstallError> {
        command.stdin(Stdio::null()).kill_on_drop(true);
        let output = command.output().await.map_err(|source| InstallError::Launch {
            program: self.program.clone(),
            source,
        })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let diagnostic = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(InstallError::Failed {
            status: output.status.to_string(),
            diagnostic,
        })
    }
}

#[async_trait]
impl Installer for UvInstaller {
    fn name(&self) -> &str {
        &self.program
    }

    async fn install(&self, target: &Path, requirements: &[String]) -> Result<(), InstallError> {
        info!(
            "Installing {} requirement(s) into {}",
            requirements.len(),
            target.display()
        );

        let mut venv = Command::new(&self.program);
        venv.arg("venv")
            .arg("--quiet")
            .arg("--python")
            .arg(&self.python)
            .arg(target);
        self.step(venv).await?;

        let interpreter = self.interpreter(target);
        let mut pip = Command::new(&self.program);
        pip.arg("pip")
            .arg("install")
            .arg("--quiet")
            .arg("--python")
            .arg(&interpreter)
            .args(requirements);
        self.step(pip).await?;

        debug!("Environment ready at {}", target.display());
        Ok(())
    }
}
