//! Merges dependency manifests and secrets across the primary source and
//! every resolved reference.
//!
//! Precedence is the caller's reference order, later wins, for both
//! dependencies and environment variables. A conflicting version
//! constraint is therefore resolved silently in favor of the last source
//! rather than rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::env::{load_env, SecretEnv};
use super::manifest::{scan, DependencyDeclaration, ScanOutcome};
use super::read_limited;
use super::resolver::ResolvedReference;
use crate::error::Result;

/// Where the primary code comes from.
#[derive(Debug, Clone, Copy)]
pub enum PrimarySource<'a> {
    /// Inline code supplied by the caller
    Text(&'a str),
    /// A script file inside a bundle
    File(&'a Path),
    /// A script that carries no manifest (non-Python)
    Opaque,
}

/// Merged inputs for one execution.
#[derive(Debug, Default)]
pub struct Aggregate {
    pub dependencies: Vec<DependencyDeclaration>,
    pub environment: SecretEnv,
    /// Non-fatal manifest anomalies, one line per affected source
    pub warnings: Vec<String>,
}

impl Aggregate {
    /// Raw requirement strings, in merged order.
    pub fn requirements(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|d| d.requirement().to_string())
            .collect()
    }
}

/// Builds the merged dependency list and environment.
pub fn aggregate(
    primary: PrimarySource<'_>,
    primary_bundle_root: Option<&Path>,
    references: &[ResolvedReference],
    max_file_bytes: u64,
) -> Result<Aggregate> {
    let mut warnings = Vec::new();
    let mut manifests = Vec::with_capacity(references.len() + 1);

    let primary_outcome = match primary {
        PrimarySource::Text(source) => scan(source),
        PrimarySource::File(path) => scan(&read_limited(path, max_file_bytes)?),
        PrimarySource::Opaque => ScanOutcome::Empty,
    };
    manifests.push(take_declarations("code", primary_outcome, &mut warnings));

    for resolved in references {
        let source = read_limited(resolved.file.absolute(), max_file_bytes)?;
        let label = resolved.reference.to_string();
        manifests.push(take_declarations(&label, scan(&source), &mut warnings));
    }

    let mut envs = Vec::with_capacity(references.len() + 1);
    let mut loaded: HashMap<PathBuf, SecretEnv> = HashMap::new();
    let bundle_roots = primary_bundle_root
        .into_iter()
        .chain(references.iter().map(|r| r.bundle_root.as_path()));
    for root in bundle_roots {
        if !loaded.contains_key(root) {
            loaded.insert(root.to_path_buf(), load_env(root, max_file_bytes)?);
        }
        if let Some(env) = loaded.get(root) {
            envs.push(env.clone());
        }
    }

    Ok(Aggregate {
        dependencies: merge_dependencies(manifests),
        environment: merge_environments(envs),
        warnings,
    })
}

fn take_declarations(
    label: &str,
    outcome: ScanOutcome,
    warnings: &mut Vec<String>,
) -> Vec<DependencyDeclaration> {
    if let Some(detail) = outcome.anomaly() {
        warn!("Ignoring dependency manifest of {label}: {detail}");
        warnings.push(format!("{label}: {detail}"));
    }
    outcome.into_declarations()
}

/// Concatenates manifests in order and dedupes by normalized package name.
/// A later declaration replaces the constraint of an earlier one but keeps
/// its position.
pub fn merge_dependencies<I>(manifests: I) -> Vec<DependencyDeclaration>
where
    I: IntoIterator<Item = Vec<DependencyDeclaration>>,
{
    let mut merged: Vec<DependencyDeclaration> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for decl in manifests.into_iter().flatten() {
        match index.get(&decl.key()) {
            Some(&pos) => merged[pos] = decl,
            None => {
                index.insert(decl.key(), merged.len());
                merged.push(decl);
            }
        }
    }
    merged
}

/// Overlays environments in order; later mappings win on collision.
pub fn merge_environments<I>(envs: I) -> SecretEnv
where
    I: IntoIterator<Item = SecretEnv>,
{
    let mut merged = SecretEnv::new();
    for env in envs {
        merged.overlay(&env);
    }
    merged
}
