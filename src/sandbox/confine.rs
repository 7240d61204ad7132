//! Path confinement: turns a caller-supplied relative path into an absolute
//! path that is guaranteed to stay inside a root directory.
//!
//! The check is lexical first (no `..`, no absolute prefix) and then
//! physical: the deepest existing ancestor of the joined path is
//! canonicalized, so a symlink inside the root that points elsewhere is
//! caught even when the final component does not exist yet.

use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

/// A path verified to lie inside its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedPath {
    root: PathBuf,
    relative: PathBuf,
    absolute: PathBuf,
}

impl ConfinedPath {
    /// Canonical root the path was checked against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolved absolute path, symlinks followed as far as they exist.
    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    /// The relative path with `/` separators, suitable for re-validation.
    pub fn relative_str(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Last component of the relative path, if any.
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.relative.file_name()
    }

    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }
}

/// Validates `candidate` against `root`.
///
/// The target does not need to exist. An empty candidate (or one made only
/// of `.` and separators) designates the root itself.
pub fn confine(root: &Path, candidate: &str) -> Result<ConfinedPath> {
    let segments = lexical_segments(candidate)?;

    let canonical_root = root
        .canonicalize()
        .map_err(|source| SandboxError::RootUnavailable {
            path: root.to_path_buf(),
            source,
        })?;

    let relative: PathBuf = segments.iter().collect();
    let joined = canonical_root.join(&relative);
    let absolute = resolve_existing_prefix(&joined, candidate)?;

    if !absolute.starts_with(&canonical_root) {
        return Err(SandboxError::ConfinementViolation {
            candidate: candidate.to_string(),
        });
    }

    Ok(ConfinedPath {
        root: canonical_root,
        relative,
        absolute,
    })
}

/// Splits a candidate into normal segments, rejecting anything that could
/// climb out of the root lexically.
fn lexical_segments(candidate: &str) -> Result<Vec<&str>> {
    if candidate.contains('\0') {
        return Err(SandboxError::InvalidPath {
            candidate: candidate.escape_default().to_string(),
            reason: "contains a NUL byte".to_string(),
        });
    }

    if is_absolute(candidate) {
        return Err(SandboxError::ConfinementViolation {
            candidate: candidate.to_string(),
        });
    }

    let mut segments = Vec::new();
    for segment in candidate.split(|c: char| c == '/' || c == '\\') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(SandboxError::ConfinementViolation {
                    candidate: candidate.to_string(),
                })
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

/// Leading separator or a Windows drive prefix (`C:`), on any platform.
fn is_absolute(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    if matches!(bytes.first(), Some(b'/') | Some(b'\\')) {
        return true;
    }
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Canonicalizes the deepest existing ancestor of `path` and re-appends the
/// components that do not exist yet.
fn resolve_existing_prefix(path: &Path, candidate: &str) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for part in missing.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(_) => {
                // A dangling symlink cannot be verified
                if existing.symlink_metadata().is_ok() {
                    return Err(SandboxError::ConfinementViolation {
                        candidate: candidate.to_string(),
                    });
                }
                match existing.file_name() {
                    Some(name) => missing.push(name.to_os_string()),
                    None => {
                        return Err(SandboxError::InvalidPath {
                            candidate: candidate.to_string(),
                            reason: "no existing ancestor".to_string(),
                        })
                    }
                }
                if !existing.pop() {
                    return Err(SandboxError::InvalidPath {
                        candidate: candidate.to_string(),
                        reason: "no existing ancestor".to_string(),
                    });
                }
            }
        }
    }
}
