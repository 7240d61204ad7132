//! Cross-bundle reference resolution.
//!
//! A reference such as `calculator:advanced/calculus.py` names one module
//! inside one bundle. Resolution validates every reference (all or
//! nothing), then stages the modules into a per-request overlay directory
//! so inline code can `import calculus` without knowing which bundle it
//! lives in.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use super::confine::{confine, ConfinedPath};
use crate::bundle::BundleStore;
use crate::error::{Result, SandboxError};

/// Prefix of the per-request staging directories.
const OVERLAY_PREFIX: &str = "skillbox-overlay-";

/// A `bundle:module` pointer supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    bundle: String,
    module: String,
}

impl Reference {
    pub fn new(bundle: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            module: module.into(),
        }
    }

    /// Parses `bundle:path/to/module.py`, splitting on the first `:`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once(':') {
            Some((bundle, module)) if !bundle.trim().is_empty() && !module.trim().is_empty() => {
                Ok(Self::new(bundle.trim(), module.trim()))
            }
            _ => Err(SandboxError::InvalidReference(text.to_string())),
        }
    }

    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bundle, self.module)
    }
}

impl FromStr for Reference {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One reference after validation.
#[derive(Debug, Clone)]
pub struct ResolvedReference {
    pub reference: Reference,
    pub bundle_root: PathBuf,
    pub file: ConfinedPath,
}

/// Ordered lookup roots for module imports; the first root wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSearchPath {
    roots: Vec<PathBuf>,
}

impl ImportSearchPath {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Joins the roots into a `PYTHONPATH`-style value, keeping any
    /// `existing` entries after ours.
    pub fn to_env_value(&self, existing: Option<OsString>) -> Result<OsString> {
        let mut paths: Vec<PathBuf> = self.roots.clone();
        if let Some(existing) = existing {
            paths.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(paths).map_err(|e| SandboxError::InvalidPath {
            candidate: "import search path".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Per-request staging directory holding links to referenced modules.
///
/// Removed from disk when dropped.
#[derive(Debug)]
pub struct Overlay {
    dir: tempfile::TempDir,
}

impl Overlay {
    /// Creates an empty overlay under `parent` (or the system temp dir).
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(OVERLAY_PREFIX);
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Makes `target` importable as `name`, replacing an earlier entry.
    fn stage(&self, name: &std::ffi::OsStr, target: &Path) -> Result<()> {
        let link = self.dir.path().join(name);
        if link.symlink_metadata().is_ok() {
            debug!(
                "Overlay entry {} replaced by a later reference",
                link.display()
            );
            std::fs::remove_file(&link)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &link)?;
        #[cfg(not(unix))]
        std::fs::copy(target, &link).map(|_| ())?;
        Ok(())
    }
}

/// Everything downstream components need about the references of a run.
#[derive(Debug)]
pub struct ResolvedReferences {
    /// In caller order; this order is the precedence order.
    pub files: Vec<ResolvedReference>,
    pub overlay: Overlay,
    pub search_path: ImportSearchPath,
}

/// Validates all references and builds the overlay.
///
/// Any invalid reference fails the whole call and names the culprit.
pub fn resolve(
    store: &BundleStore,
    references: &[Reference],
    overlay_parent: Option<&Path>,
) -> Result<ResolvedReferences> {
    let known = if references.is_empty() {
        BTreeSet::new()
    } else {
        store.list_bundle_names()?
    };

    let mut files = Vec::with_capacity(references.len());
    for reference in references {
        let resolved = resolve_one(store, &known, reference)
            .map_err(|e| e.for_reference(&reference.to_string()))?;
        files.push(resolved);
    }

    let overlay = Overlay::create(overlay_parent)?;
    for resolved in &files {
        if let Some(name) = resolved.file.file_name() {
            overlay.stage(name, resolved.file.absolute())?;
        }
    }

    let search_path = build_search_path(overlay.path(), &files);
    debug!(
        "Resolved {} reference(s), overlay at {}",
        files.len(),
        overlay.path().display()
    );

    Ok(ResolvedReferences {
        files,
        overlay,
        search_path,
    })
}

fn resolve_one(
    store: &BundleStore,
    known: &BTreeSet<String>,
    reference: &Reference,
) -> Result<ResolvedReference> {
    BundleStore::validate_name(reference.bundle())?;
    if !known.contains(reference.bundle()) {
        return Err(SandboxError::BundleNotFound(reference.bundle().to_string()));
    }
    let bundle_root = store.bundle_root(reference.bundle())?;
    let file = confine(&bundle_root, reference.module())?;
    if file.is_root() || !file.absolute().is_file() {
        return Err(SandboxError::ReferenceNotFound {
            reference: reference.to_string(),
        });
    }
    Ok(ResolvedReference {
        reference: reference.clone(),
        bundle_root,
        file,
    })
}

/// Overlay first, then bundle roots with later references searched first,
/// mirroring the later-wins rule used for environments and dependencies.
fn build_search_path(overlay: &Path, files: &[ResolvedReference]) -> ImportSearchPath {
    let mut roots = vec![overlay.to_path_buf()];
    for resolved in files.iter().rev() {
        if !roots.contains(&resolved.bundle_root) {
            roots.push(resolved.bundle_root.clone());
        }
    }
    ImportSearchPath::new(roots)
}
