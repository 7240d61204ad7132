//! Sandboxed execution of bundle scripts and inline code.
//!
//! Every request goes through the same pipeline:
//!
//! 1. Path confinement: the script, working directory, and every
//!    reference must stay inside their bundle.
//! 2. Reference resolution: `bundle:module` pointers are validated and
//!    staged into a per-request overlay directory.
//! 3. Aggregation: dependency manifests and `.env` secrets are merged,
//!    later sources winning.
//! 4. Execution: dependencies installed into a cached environment, then
//!    the child runs with a deadline and capped output.
//!
//! Nothing spawns before steps 1 to 3 have succeeded.

pub mod aggregate;
pub mod cache;
pub mod confine;
pub mod env;
pub mod installer;
pub mod manifest;
pub mod process;
pub mod resolver;
pub mod runner;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::bundle::{BundleStore, ScriptKind};
use crate::config::{Config, ExecutionConfig};
use crate::error::{Result, SandboxError};

use aggregate::{aggregate, PrimarySource};
use cache::EnvCache;
use confine::confine;
use installer::{Installer, UvInstaller};
pub use resolver::Reference;
use resolver::{resolve, ImportSearchPath};
pub use runner::{ExecutionResult, Outcome, FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};
use runner::{Invocation, Runner};

/// Reads a text file after checking it against `limit` bytes.
pub(crate) fn read_limited(path: &Path, limit: u64) -> Result<String> {
    let size = std::fs::metadata(path)?.len();
    if size > limit {
        return Err(SandboxError::FileTooLarge {
            path: path.to_path_buf(),
            size,
            limit,
        });
    }
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Entry point for executions. Cheap to share behind an `Arc`.
pub struct Engine {
    store: BundleStore,
    execution: ExecutionConfig,
    cache: Arc<EnvCache>,
    runner: Runner,
}

impl Engine {
    /// Engine installing dependencies with the configured `uv`.
    pub fn new(config: &Config) -> Self {
        let installer = Arc::new(UvInstaller::new(
            &config.execution.installer,
            &config.execution.python,
        ));
        Self::with_installer(config, installer)
    }

    pub fn with_installer(config: &Config, installer: Arc<dyn Installer>) -> Self {
        let execution = config.execution.clone();
        let cache = Arc::new(EnvCache::new(execution.cache_dir.clone(), installer));
        let runner = Runner::new(execution.clone(), Arc::clone(&cache));
        Self {
            store: BundleStore::new(config.storage.root.clone(), execution.max_file_bytes),
            execution,
            cache,
            runner,
        }
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Runs a script stored in a bundle.
    ///
    /// `working_dir` is relative to the bundle root and must be an existing
    /// directory; by default the script runs from its own directory.
    pub async fn run_script(
        &self,
        bundle: &str,
        script: &str,
        args: &[String],
        working_dir: Option<&str>,
    ) -> Result<ExecutionResult> {
        let bundle_root = self.store.bundle_root(bundle)?;
        let file = confine(&bundle_root, script)?;
        if file.is_root() || !file.absolute().is_file() {
            return Err(SandboxError::ScriptNotFound {
                bundle: bundle.to_string(),
                script: script.to_string(),
            });
        }

        let working_dir = match working_dir {
            Some(dir) => {
                let confined = confine(&bundle_root, dir)?;
                if !confined.absolute().is_dir() {
                    return Err(SandboxError::NotADirectory(dir.to_string()));
                }
                confined.absolute().to_path_buf()
            }
            None => file
                .absolute()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| bundle_root.clone()),
        };

        let kind = ScriptKind::from_path(file.absolute());
        let primary = match kind {
            ScriptKind::Python => PrimarySource::File(file.absolute()),
            _ => PrimarySource::Opaque,
        };
        let merged = aggregate(primary, Some(&bundle_root), &[], self.store.max_file_bytes())?;

        info!("Running {bundle}:{} with {} arg(s)", file.relative_str(), args.len());
        let invocation = Invocation {
            script: file.absolute().to_path_buf(),
            kind,
            args: args.to_vec(),
            working_dir,
            requirements: merged.requirements(),
            environment: merged.environment,
            search_path: ImportSearchPath::new(vec![bundle_root]),
            warnings: merged.warnings,
        };
        let result = self.runner.execute(invocation).await;
        self.release_idle_environments();
        Ok(result)
    }

    /// Runs inline Python code with modules from other bundles importable.
    ///
    /// All references are validated before anything runs; the first bad one
    /// fails the call. On a collision the later reference wins for
    /// environment variables, dependencies, and module names.
    pub async fn run_code(&self, source: &str, references: &[Reference]) -> Result<ExecutionResult> {
        let resolved = resolve(&self.store, references, None)?;
        let merged = aggregate(
            PrimarySource::Text(source),
            None,
            &resolved.files,
            self.store.max_file_bytes(),
        )?;

        let script: PathBuf = resolved
            .overlay
            .path()
            .join(format!("inline_{}.py", Uuid::new_v4().simple()));
        std::fs::write(&script, source)?;

        info!(
            "Running inline code with {} reference(s), {} dependency(ies)",
            references.len(),
            merged.dependencies.len()
        );
        let invocation = Invocation {
            script,
            kind: ScriptKind::Python,
            args: Vec::new(),
            working_dir: resolved.overlay.path().to_path_buf(),
            requirements: merged.requirements(),
            environment: merged.environment,
            search_path: resolved.search_path.clone(),
            warnings: merged.warnings,
        };
        let result = self.runner.execute(invocation).await;

        // Overlay removed only once the child is gone
        drop(resolved);
        self.release_idle_environments();
        Ok(result)
    }

    fn release_idle_environments(&self) {
        let released = self.cache.prune();
        if released > 0 {
            debug!("Released {released} idle environment entr(ies)");
        }
    }

    /// Variable names from a bundle's `.env`; values never leave the engine.
    pub fn env_keys(&self, bundle: &str) -> Result<Vec<String>> {
        let root = self.store.bundle_root(bundle)?;
        env::env_keys(&root, self.store.max_file_bytes())
    }

    pub fn list_scripts(&self, bundle: &str) -> Result<Vec<String>> {
        self.store.list_scripts(bundle)
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sandbox::installer::InstallError;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Builds an "environment" whose interpreter is /bin/sh.
    struct ShellEnvInstaller {
        installs: AtomicUsize,
    }

    #[async_trait]
    impl Installer for ShellEnvInstaller {
        fn name(&self) -> &str {
            "shell-env"
        }

        async fn install(&self, target: &Path, requirements: &[String]) -> std::result::Result<(), InstallError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(target.join("bin"))?;
            fs::write(target.join("requirements.txt"), requirements.join("\n"))?;
            std::os::unix::fs::symlink("/bin/sh", target.join("bin/python"))?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        engine: Engine,
        installer: Arc<ShellEnvInstaller>,
    }

    /// Bundles `calc` and `lib2`; "python" is /bin/sh so scripts are shell.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("skills");
        fs::create_dir_all(root.join("calc/advanced")).unwrap();
        fs::create_dir_all(root.join("calc/data")).unwrap();
        fs::create_dir_all(root.join("lib2")).unwrap();
        fs::write(root.join("calc/.env"), "API_KEY=calc-key\nSHARED=calc\n").unwrap();
        fs::write(root.join("lib2/.env"), "SHARED=lib2\n").unwrap();
        fs::write(
            root.join("calc/advanced/calculus.py"),
            "# /// script\n# dependencies = [\"sympy>=1.12\"]\n# ///\n",
        )
        .unwrap();
        fs::write(root.join("calc/run.sh"), "echo \"$API_KEY\"; pwd; echo \"$@\"\n").unwrap();
        fs::write(root.join("lib2/helpers.py"), "X = 1\n").unwrap();

        let mut config = Config::default();
        config.storage.root = root.clone();
        config.execution.cache_dir = dir.path().join("envs");
        config.execution.python = "/bin/sh".to_string();
        config.execution.bash = "/bin/sh".to_string();
        config.execution.timeout_secs = 10;

        let installer = Arc::new(ShellEnvInstaller {
            installs: AtomicUsize::new(0),
        });
        let engine = Engine::with_installer(&config, installer.clone());
        Fixture {
            _dir: dir,
            root,
            engine,
            installer,
        }
    }

    fn canon(path: &Path) -> PathBuf {
        path.canonicalize().unwrap()
    }

    // ── read_limited ───────────────────────────────────

    #[test]
    fn test_read_limited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, "12345").unwrap();
        assert_eq!(read_limited(&path, 5).unwrap(), "12345");
        assert!(matches!(
            read_limited(&path, 4),
            Err(SandboxError::FileTooLarge { size: 5, limit: 4, .. })
        ));
    }

    // ── run_script ─────────────────────────────────────

    #[tokio::test]
    async fn test_run_script_defaults_to_script_directory() {
        let fx = fixture();
        let args = vec!["x".to_string(), "y".to_string()];
        let result = fx.engine.run_script("calc", "run.sh", &args, None).await.unwrap();

        assert_eq!(result.outcome, Outcome::Completed);
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "calc-key");
        assert_eq!(canon(Path::new(lines[1])), canon(&fx.root.join("calc")));
        assert_eq!(lines[2], "x y");
    }

    #[tokio::test]
    async fn test_run_script_with_working_dir() {
        let fx = fixture();
        let result = fx
            .engine
            .run_script("calc", "run.sh", &[], Some("data"))
            .await
            .unwrap();
        let cwd = result.stdout.lines().nth(1).unwrap().to_string();
        assert_eq!(canon(Path::new(&cwd)), canon(&fx.root.join("calc/data")));
    }

    #[tokio::test]
    async fn test_run_script_rejects_bad_paths_before_spawning() {
        let fx = fixture();
        let err = fx
            .engine
            .run_script("calc", "../lib2/helpers.py", &[], None)
            .await
            .unwrap_err();
        assert!(err.is_confinement_violation());

        let err = fx
            .engine
            .run_script("calc", "run.sh", &[], Some("/tmp"))
            .await
            .unwrap_err();
        assert!(err.is_confinement_violation());

        let err = fx
            .engine
            .run_script("calc", "run.sh", &[], Some("run.sh"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotADirectory(_)));

        let err = fx
            .engine
            .run_script("calc", "missing.sh", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ScriptNotFound { .. }));

        let err = fx.engine.run_script("ghost", "run.sh", &[], None).await.unwrap_err();
        assert!(matches!(err, SandboxError::BundleNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_script_installs_declared_dependencies() {
        let fx = fixture();
        fs::write(
            fx.root.join("calc/deps.py"),
            "# /// script\n# dependencies = [\"rich\"]\n# ///\necho \"$VIRTUAL_ENV\"\n",
        )
        .unwrap();

        let result = fx.engine.run_script("calc", "deps.py", &[], None).await.unwrap();

        assert_eq!(result.outcome, Outcome::Completed, "stderr: {}", result.stderr);
        let venv = PathBuf::from(result.stdout.trim());
        assert!(venv.starts_with(fx.engine.execution().cache_dir.as_path()));
        assert_eq!(fs::read_to_string(venv.join("requirements.txt")).unwrap(), "rich");
        assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 1);
    }

    // ── run_code ───────────────────────────────────────

    #[tokio::test]
    async fn test_run_code_with_references() {
        let fx = fixture();
        let refs = vec![
            Reference::parse("calc:advanced/calculus.py").unwrap(),
            Reference::parse("lib2:helpers.py").unwrap(),
        ];
        let code = "echo \"$API_KEY $SHARED\"\nls \"$(pwd)\" | grep -v inline_ | sort\necho \"$VIRTUAL_ENV\"\n";

        let result = fx.engine.run_code(code, &refs).await.unwrap();

        assert_eq!(result.outcome, Outcome::Completed, "stderr: {}", result.stderr);
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "calc-key lib2");
        assert_eq!(&lines[1..3], &["calculus.py", "helpers.py"]);
        // Dependency declared by the referenced module got installed
        let venv = PathBuf::from(lines[3]);
        assert_eq!(fs::read_to_string(venv.join("requirements.txt")).unwrap(), "sympy>=1.12");
    }

    #[tokio::test]
    async fn test_run_code_overlay_is_removed() {
        let fx = fixture();
        let result = fx.engine.run_code("pwd\n", &[]).await.unwrap();
        let overlay = PathBuf::from(result.stdout.trim());
        assert!(overlay
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("skillbox-overlay-"));
        assert!(!overlay.exists());
    }

    #[tokio::test]
    async fn test_run_code_rejects_bad_reference_without_running() {
        let fx = fixture();
        let marker = fx.root.join("ran");
        let refs = vec![
            Reference::parse("lib2:helpers.py").unwrap(),
            Reference::parse("calc:../lib2/helpers.py").unwrap(),
        ];
        let code = format!("touch {}\n", marker.display());

        let err = fx.engine.run_code(&code, &refs).await.unwrap_err();
        assert!(err.is_confinement_violation());
        assert!(err.to_string().contains("calc:../lib2/helpers.py"));
        assert!(!marker.exists());
        assert_eq!(fx.installer.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_code_timeout() {
        let mut fx = fixture();
        let mut config = Config::default();
        config.storage.root = fx.root.clone();
        config.execution.python = "/bin/sh".to_string();
        config.execution.timeout_secs = 1;
        fx.engine = Engine::with_installer(&config, fx.installer.clone());

        let result = fx.engine.run_code("echo begin\nsleep 30\n", &[]).await.unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "begin\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancelled_run_code_kills_child_and_removes_overlay() {
        let fx = fixture();
        let report = fx.root.join("report.txt");
        let code = format!("pwd > {0}; echo $$ >> {0}; sleep 30\n", report.display());

        let cancelled =
            tokio::time::timeout(Duration::from_millis(500), fx.engine.run_code(&code, &[])).await;
        assert!(cancelled.is_err());

        let text = fs::read_to_string(&report).unwrap();
        let mut lines = text.lines();
        let overlay = PathBuf::from(lines.next().unwrap());
        let pid: u32 = lines.next().unwrap().parse().unwrap();
        assert!(!overlay.exists());

        let mut alive = true;
        for _ in 0..50 {
            alive = match fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => !stat
                    .rsplit_once(')')
                    .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            };
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "child {pid} outlived the cancelled run");
    }

    // ── listings ───────────────────────────────────────

    #[test]
    fn test_env_keys_and_scripts() {
        let fx = fixture();
        assert_eq!(fx.engine.env_keys("calc").unwrap(), vec!["API_KEY", "SHARED"]);
        assert_eq!(
            fx.engine.list_scripts("calc").unwrap(),
            vec!["advanced/calculus.py", "run.sh"]
        );
        assert!(fx.engine.env_keys("lib2").is_ok());
        assert!(fx.engine.env_keys("nope").is_err());
    }
}
