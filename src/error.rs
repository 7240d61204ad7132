use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the execution core before any process is spawned.
///
/// Failures that happen once a process is underway (dependency install,
/// spawn failure, timeout) are not errors: they are reported through
/// [`crate::sandbox::ExecutionResult`] so callers can render every run the
/// same way.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The candidate path escapes its root directory.
    #[error("path '{candidate}' escapes its root directory")]
    ConfinementViolation { candidate: String },

    /// The candidate path is syntactically unusable (empty, NUL byte...).
    #[error("invalid path '{candidate}': {reason}")]
    InvalidPath { candidate: String, reason: String },

    #[error("invalid skill name '{0}': only letters, digits, '-' and '_' are allowed")]
    InvalidBundleName(String),

    #[error("skill '{0}' does not exist")]
    BundleNotFound(String),

    /// A referenced module could not be found inside its bundle.
    #[error("reference '{reference}' does not point to a file")]
    ReferenceNotFound { reference: String },

    #[error("invalid skill reference format: '{0}'. Expected 'skill_name:path/to/file.py'")]
    InvalidReference(String),

    /// A reference was valid on its own but failed during resolution.
    #[error("reference '{reference}' is invalid: {source}")]
    Reference {
        reference: String,
        #[source]
        source: Box<SandboxError>,
    },

    #[error("script '{script}' does not exist in skill '{bundle}'")]
    ScriptNotFound { bundle: String, script: String },

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("file '{path}' is too large ({size} bytes, limit is {limit} bytes)")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("root directory '{path}' is unavailable: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Wraps this error with the textual reference that caused it.
    ///
    /// Errors that already name the reference are returned unchanged.
    pub fn for_reference(self, reference: &str) -> Self {
        match self {
            err @ (SandboxError::ReferenceNotFound { .. }
            | SandboxError::InvalidReference(_)
            | SandboxError::Reference { .. }) => err,
            other => SandboxError::Reference {
                reference: reference.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// True for errors caused by a path that tries to leave its root.
    pub fn is_confinement_violation(&self) -> bool {
        match self {
            SandboxError::ConfinementViolation { .. } => true,
            SandboxError::Reference { source, .. } => source.is_confinement_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_reference_wraps_once() {
        let err = SandboxError::BundleNotFound("lib".into()).for_reference("lib:a.py");
        let msg = err.to_string();
        assert!(msg.contains("lib:a.py"));
        assert!(msg.contains("skill 'lib' does not exist"));

        let again = err.for_reference("other:b.py");
        assert!(again.to_string().contains("lib:a.py"));
    }

    #[test]
    fn test_for_reference_keeps_reference_errors() {
        let err = SandboxError::ReferenceNotFound {
            reference: "lib:missing.py".into(),
        }
        .for_reference("lib:missing.py");
        assert!(matches!(err, SandboxError::ReferenceNotFound { .. }));
    }

    #[test]
    fn test_is_confinement_violation_through_reference() {
        let err = SandboxError::ConfinementViolation {
            candidate: "../x".into(),
        }
        .for_reference("lib:../x");
        assert!(err.is_confinement_violation());
        assert!(!SandboxError::BundleNotFound("x".into()).is_confinement_violation());
    }

    #[test]
    fn test_invalid_reference_message() {
        let err = SandboxError::InvalidReference("noseparator".into());
        assert!(err.to_string().contains("Expected 'skill_name:path/to/file.py'"));
    }
}
