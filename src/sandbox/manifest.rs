//! Inline dependency manifest scanner.
//!
//! Recognizes the PEP 723 comment block:
//!
//! ```text
//! # /// script
//! # dependencies = [
//! #   "requests>=2.31.0",
//! # ]
//! # ///
//! ```
//!
//! Scanning is purely textual; the scanned source is never executed.

use std::fmt;

const OPEN_MARKER: &str = "# /// script";
const CLOSE_MARKER: &str = "# ///";

/// One `(package, constraint)` pair taken from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDeclaration {
    name: String,
    constraint: String,
    requirement: String,
}

impl DependencyDeclaration {
    /// Parses a requirement string such as `pkg>=1.0`, `pkg[extra]~=2`,
    /// or `pkg ; python_version < "3.11"`.
    pub fn parse(requirement: &str) -> Option<Self> {
        let requirement = requirement.trim();
        let name_len = requirement
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(requirement.len());
        let name = &requirement[..name_len];

        if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return None;
        }

        Some(Self {
            name: name.to_string(),
            constraint: requirement[name_len..].trim().to_string(),
            requirement: requirement.to_string(),
        })
    }

    /// Package name as written.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Everything after the name (extras, version specifiers, markers).
    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    /// The full requirement string handed to the installer.
    pub fn requirement(&self) -> &str {
        &self.requirement
    }

    /// Normalized name used for deduplication: lowercase, with runs of
    /// `-`, `_` and `.` folded into a single `-`.
    pub fn key(&self) -> String {
        let mut key = String::with_capacity(self.name.len());
        let mut in_separator = false;
        for c in self.name.chars() {
            if matches!(c, '-' | '_' | '.') {
                if !in_separator {
                    key.push('-');
                }
                in_separator = true;
            } else {
                key.push(c.to_ascii_lowercase());
                in_separator = false;
            }
        }
        key
    }
}

impl fmt::Display for DependencyDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.requirement)
    }
}

/// Result of scanning one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Declarations(Vec<DependencyDeclaration>),
    Empty,
    /// The block exists but could not be understood. Non-fatal: callers
    /// treat it as "no declarations" and surface the detail as a warning.
    Anomaly(String),
}

impl ScanOutcome {
    pub fn declarations(&self) -> &[DependencyDeclaration] {
        match self {
            ScanOutcome::Declarations(decls) => decls,
            _ => &[],
        }
    }

    pub fn anomaly(&self) -> Option<&str> {
        match self {
            ScanOutcome::Anomaly(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn into_declarations(self) -> Vec<DependencyDeclaration> {
        match self {
            ScanOutcome::Declarations(decls) => decls,
            _ => Vec::new(),
        }
    }
}

/// Extracts the first manifest block of `source`.
pub fn scan(source: &str) -> ScanOutcome {
    let body = match extract_block(source) {
        Ok(Some(body)) => body,
        Ok(None) => return ScanOutcome::Empty,
        Err(detail) => return ScanOutcome::Anomaly(detail),
    };

    let table: toml::Table = match toml::from_str(&body) {
        Ok(table) => table,
        Err(e) => return ScanOutcome::Anomaly(format!("invalid manifest TOML: {}", e.message())),
    };

    let deps = match table.get("dependencies") {
        None => return ScanOutcome::Empty,
        Some(toml::Value::Array(items)) => items,
        Some(other) => {
            return ScanOutcome::Anomaly(format!(
                "'dependencies' must be an array of strings, found {}",
                other.type_str()
            ))
        }
    };

    let mut declarations = Vec::with_capacity(deps.len());
    for item in deps {
        let Some(raw) = item.as_str() else {
            return ScanOutcome::Anomaly(format!(
                "'dependencies' entries must be strings, found {}",
                item.type_str()
            ));
        };
        match DependencyDeclaration::parse(raw) {
            Some(decl) => declarations.push(decl),
            None => return ScanOutcome::Anomaly(format!("invalid requirement '{raw}'")),
        }
    }

    if declarations.is_empty() {
        ScanOutcome::Empty
    } else {
        ScanOutcome::Declarations(declarations)
    }
}

/// Returns the uncommented block body, `None` when there is no block, or a
/// description of why the block is malformed.
fn extract_block(source: &str) -> Result<Option<String>, String> {
    let mut lines = source.lines().enumerate();

    let open_line = loop {
        match lines.next() {
            Some((idx, line)) if line.trim_end() == OPEN_MARKER => break idx + 1,
            Some(_) => continue,
            None => return Ok(None),
        }
    };

    let mut body = String::new();
    for (idx, line) in lines {
        let line = line.trim_end();
        if line == CLOSE_MARKER {
            return Ok(Some(body));
        }
        let content = if line == "#" {
            ""
        } else if let Some(rest) = line.strip_prefix("# ") {
            rest
        } else {
            return Err(format!(
                "line {} inside the manifest block is not a comment",
                idx + 1
            ));
        };
        body.push_str(content);
        body.push('\n');
    }

    Err(format!("manifest block opened on line {open_line} is never closed"))
}
