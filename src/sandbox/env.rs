//! Per-bundle secrets (`.env`) loading.
//!
//! Values only ever travel from here to the aggregator and then into the
//! child process environment. Listing paths get keys, and the `Debug`
//! rendering of [`SecretEnv`] redacts values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use super::confine::confine;
use super::read_limited;
use crate::error::Result;

/// Name of the secrets file at the root of each bundle.
pub const ENV_FILE_NAME: &str = ".env";

/// Key/value mapping whose values must never be displayed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretEnv(BTreeMap<String, String>);

impl SecretEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted keys. This is the only view meant for listings.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Overlays `other` on top of `self`; `other` wins on collision.
    pub fn overlay(&mut self, other: &SecretEnv) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Key/value pairs for injection into a process environment.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for SecretEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Reads the raw secrets file of a bundle, `None` when there is none.
///
/// The file name goes through confinement so a `.env` symlink pointing
/// outside the bundle is refused.
pub fn read_secrets(bundle_root: &Path, max_file_bytes: u64) -> Result<Option<String>> {
    let path = confine(bundle_root, ENV_FILE_NAME)?;
    if !path.absolute().is_file() {
        return Ok(None);
    }
    read_limited(path.absolute(), max_file_bytes).map(Some)
}

/// Loads a bundle's secrets; an absent file yields an empty mapping.
pub fn load_env(bundle_root: &Path, max_file_bytes: u64) -> Result<SecretEnv> {
    let env = match read_secrets(bundle_root, max_file_bytes)? {
        Some(content) => parse_env(&content),
        None => SecretEnv::new(),
    };
    debug!(
        "Loaded {} secret(s) from {}",
        env.len(),
        bundle_root.display()
    );
    Ok(env)
}

/// Sorted variable names of a bundle's secrets file.
pub fn env_keys(bundle_root: &Path, max_file_bytes: u64) -> Result<Vec<String>> {
    Ok(load_env(bundle_root, max_file_bytes)?.keys())
}

/// Parses dotenv-style content. Malformed lines are skipped.
pub fn parse_env(content: &str) -> SecretEnv {
    let mut env = SecretEnv::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            // Never log the line itself, it may hold a secret
            warn!("Skipping malformed .env line {}", idx + 1);
            continue;
        };
        let key = key.trim();
        if !is_valid_key(key) {
            warn!("Skipping .env line {}: invalid variable name", idx + 1);
            continue;
        }

        match parse_value(value.trim()) {
            Some(value) => env.insert(key, value),
            None => warn!("Skipping .env line {}: unterminated quote", idx + 1),
        }
    }

    env
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_value(value: &str) -> Option<String> {
    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => return Some(out),
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => return None,
                },
                c => out.push(c),
            }
        }
        return None;
    }

    if let Some(rest) = value.strip_prefix('\'') {
        return rest.find('\'').map(|end| rest[..end].to_string());
    }

    // Unquoted: a " #" starts an inline comment
    let value = match value.find(" #") {
        Some(pos) => &value[..pos],
        None => value,
    };
    Some(value.trim_end().to_string())
}
