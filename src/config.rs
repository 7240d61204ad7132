use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `[storage] root`.
pub const ROOT_ENV_VAR: &str = "SKILLBOX_DIR";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per skill bundle.
    /// Supports ${ENV_VAR} and ~ substitution
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-stream ceiling on captured stdout/stderr
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Ceiling for any bundle file the core reads (scripts, modules, .env)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_bash")]
    pub bash: String,
    #[serde(default = "default_node")]
    pub node: String,
    /// Program used to build isolated Python environments (uv)
    #[serde(default = "default_installer")]
    pub installer: String,
    /// Where dependency-set environments are materialized
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from("~/.skillbox/skills")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    100_000
}

fn default_max_file_bytes() -> u64 {
    1_000_000
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_bash() -> String {
    "bash".to_string()
}

fn default_node() -> String {
    "node".to_string()
}

fn default_installer() -> String {
    "uv".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("~/.skillbox/envs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_file_bytes: default_max_file_bytes(),
            python: default_python(),
            bash: default_bash(),
            node: default_node(),
            installer: default_installer(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Loads the config file, or the defaults when `path` does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            Config::default()
        };
        config.finish()
    }

    /// Parses TOML content after expanding ${ENV_VAR} references.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Applies the SKILLBOX_DIR override and expands `~` in paths.
    fn finish(mut self) -> anyhow::Result<Self> {
        if let Ok(dir) = std::env::var(ROOT_ENV_VAR) {
            if !dir.is_empty() {
                self.storage.root = PathBuf::from(dir);
            }
        }
        self.storage.root = expand_path(&self.storage.root)?;
        self.execution.cache_dir = expand_path(&self.execution.cache_dir)?;
        Ok(self)
    }
}

fn expand_path(path: &Path) -> anyhow::Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)?;
    Ok(PathBuf::from(expanded.as_ref()))
}
