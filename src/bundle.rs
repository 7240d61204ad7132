//! Read-only view of the skill bundle directory.
//!
//! Layout:
//!   {root}/{bundle}/       one directory per bundle
//!   {root}/{bundle}/.env   optional secrets (KEY=VALUE)
//!   {root}/{bundle}/**     scripts and importable modules
//!
//! Creating and editing bundles is someone else's job; the execution core
//! only reads through this type.

use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, SandboxError};
use crate::sandbox::confine::confine;
use crate::sandbox::env;

/// Maximum length of a bundle name.
const MAX_NAME_LEN: usize = 64;

/// Directories never descended into when listing scripts.
const SKIPPED_DIRS: &[&str] = &["node_modules", "__pycache__"];

/// How a script is launched, based on its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Python,
    Shell,
    JavaScript,
    /// Anything else: executed directly (shebang or native binary)
    Other,
}

impl ScriptKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "py" => ScriptKind::Python,
            "sh" | "bash" | "zsh" => ScriptKind::Shell,
            "js" | "mjs" => ScriptKind::JavaScript,
            _ => ScriptKind::Other,
        }
    }
}

/// Detects whether a file looks runnable: known script extension, a
/// shebang line, or (on unix) the executable bit.
pub fn is_executable_script(path: &Path) -> bool {
    if ScriptKind::from_path(path) != ScriptKind::Other {
        return true;
    }

    if let Ok(file) = fs::File::open(path) {
        let mut first = String::new();
        if BufReader::new(file).read_line(&mut first).is_ok() && first.starts_with("#!") {
            return true;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            return meta.permissions().mode() & 0o111 != 0;
        }
    }

    false
}

/// Access to the bundles stored under one root directory.
#[derive(Debug, Clone)]
pub struct BundleStore {
    root: PathBuf,
    max_file_bytes: u64,
}

impl BundleStore {
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_file_bytes,
        }
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Bundle names are restricted to `[A-Za-z0-9_-]`, 1 to 64 characters.
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(SandboxError::InvalidBundleName(name.to_string()))
        }
    }

    /// Absolute, confined directory of a bundle.
    pub fn bundle_root(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        let dir = match confine(&self.root, name) {
            Ok(dir) => dir,
            Err(SandboxError::RootUnavailable { .. }) => {
                return Err(SandboxError::BundleNotFound(name.to_string()))
            }
            Err(e) => return Err(e),
        };
        if !dir.absolute().is_dir() {
            return Err(SandboxError::BundleNotFound(name.to_string()));
        }
        Ok(dir.absolute().to_path_buf())
    }

    /// Raw secrets file content of a bundle, if it has one.
    pub fn read_secrets(&self, bundle_root: &Path) -> Result<Option<String>> {
        env::read_secrets(bundle_root, self.max_file_bytes)
    }

    /// Names of all bundles; a missing root simply has none.
    pub fn list_bundle_names(&self) -> Result<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Self::validate_name(&name).is_ok() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Relative paths (with `/` separators) of the runnable scripts in a
    /// bundle, sorted. Hidden entries and dependency folders are skipped.
    pub fn list_scripts(&self, name: &str) -> Result<Vec<String>> {
        let root = self.bundle_root(name)?;
        let mut scripts = Vec::new();

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e.file_name().to_str()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry in {name}: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_executable_script(entry.path()) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&root) {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                scripts.push(rel);
            }
        }

        scripts.sort();
        Ok(scripts)
    }
}

fn is_skipped(name: Option<&str>) -> bool {
    match name {
        Some(name) => name.starts_with('.') || SKIPPED_DIRS.contains(&name),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(bundles: &[&str]) -> (tempfile::TempDir, BundleStore) {
        let dir = tempfile::tempdir().unwrap();
        for name in bundles {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let store = BundleStore::new(dir.path(), 1_000_000);
        (dir, store)
    }

    // ── Names ──────────────────────────────────────────

    #[test]
    fn test_validate_name() {
        assert!(BundleStore::validate_name("weather-skill").is_ok());
        assert!(BundleStore::validate_name("lib_2").is_ok());
        assert!(BundleStore::validate_name("").is_err());
        assert!(BundleStore::validate_name("..").is_err());
        assert!(BundleStore::validate_name("a/b").is_err());
        assert!(BundleStore::validate_name("has space").is_err());
        assert!(BundleStore::validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_bundle_root_found() {
        let (dir, store) = store_with(&["calc"]);
        let root = store.bundle_root("calc").unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap().join("calc"));
    }

    #[test]
    fn test_bundle_root_missing() {
        let (_dir, store) = store_with(&[]);
        assert!(matches!(
            store.bundle_root("ghost"),
            Err(SandboxError::BundleNotFound(_))
        ));
    }

    #[test]
    fn test_bundle_root_missing_store_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("nope"), 1_000);
        assert!(matches!(
            store.bundle_root("calc"),
            Err(SandboxError::BundleNotFound(_))
        ));
        assert!(store.list_bundle_names().unwrap().is_empty());
    }

    #[test]
    fn test_bundle_root_file_is_not_bundle() {
        let (dir, store) = store_with(&[]);
        fs::write(dir.path().join("file"), "x").unwrap();
        assert!(matches!(
            store.bundle_root("file"),
            Err(SandboxError::BundleNotFound(_))
        ));
    }

    #[test]
    fn test_list_bundle_names() {
        let (dir, store) = store_with(&["b", "a", "bad name"]);
        fs::write(dir.path().join("loose.txt"), "x").unwrap();
        let names: Vec<String> = store.list_bundle_names().unwrap().into_iter().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_read_secrets() {
        let (dir, store) = store_with(&["s"]);
        let root = store.bundle_root("s").unwrap();
        assert_eq!(store.read_secrets(&root).unwrap(), None);
        fs::write(dir.path().join("s/.env"), "K=V\n").unwrap();
        assert_eq!(store.read_secrets(&root).unwrap().as_deref(), Some("K=V\n"));
    }

    // ── Scripts ────────────────────────────────────────

    #[test]
    fn test_script_kind_from_path() {
        assert_eq!(ScriptKind::from_path(Path::new("a.py")), ScriptKind::Python);
        assert_eq!(ScriptKind::from_path(Path::new("a.PY")), ScriptKind::Python);
        assert_eq!(ScriptKind::from_path(Path::new("b.sh")), ScriptKind::Shell);
        assert_eq!(ScriptKind::from_path(Path::new("b.bash")), ScriptKind::Shell);
        assert_eq!(ScriptKind::from_path(Path::new("c.mjs")), ScriptKind::JavaScript);
        assert_eq!(ScriptKind::from_path(Path::new("tool")), ScriptKind::Other);
    }

    #[test]
    fn test_list_scripts() {
        let (dir, store) = store_with(&["tools"]);
        let base = dir.path().join("tools");
        fs::create_dir_all(base.join("scripts")).unwrap();
        fs::create_dir_all(base.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(base.join(".venv/bin")).unwrap();
        fs::write(base.join("main.py"), "print(1)").unwrap();
        fs::write(base.join("scripts/run.sh"), "echo hi").unwrap();
        fs::write(base.join("scripts/tool"), "#!/bin/sh\necho tool\n").unwrap();
        fs::write(base.join("README.md"), "# docs").unwrap();
        fs::write(base.join("node_modules/pkg/index.js"), "").unwrap();
        fs::write(base.join(".venv/bin/activate.sh"), "").unwrap();

        let scripts = store.list_scripts("tools").unwrap();
        assert_eq!(scripts, vec!["main.py", "scripts/run.sh", "scripts/tool"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_counts() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("binary");
        fs::write(&bin, [0u8, 1, 2]).unwrap();
        assert!(!is_executable_script(&bin));
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable_script(&bin));
    }
}
