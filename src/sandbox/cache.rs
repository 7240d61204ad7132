//! Shared cache of installed dependency environments.
//!
//! One environment per distinct dependency set, stored under
//! `{cache_dir}/{sha1 of sorted requirements}`. Concurrent requests for the
//! same set wait on a single installation. Across processes sharing the
//! directory, installs of one key are serialized by an exclusive lock on
//! `{cache_dir}/{key}.lock`. A completion marker inside the environment
//! lets a later process reuse it without reinstalling.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use sha1::{Digest, Sha1};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::installer::{InstallError, Installer};

/// Written once installation succeeded; holds the requirement list.
const MARKER_FILE: &str = ".skillbox-complete";

struct Slot {
    ready: OnceCell<PathBuf>,
    leases: AtomicUsize,
}

/// Keeps an environment's map entry alive while an execution uses it.
struct LeaseCount(Arc<Slot>);

impl LeaseCount {
    fn new(slot: Arc<Slot>) -> Self {
        slot.leases.fetch_add(1, Ordering::SeqCst);
        Self(slot)
    }
}

impl Drop for LeaseCount {
    fn drop(&mut self) {
        self.0.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A ready environment, held for the duration of one execution.
pub struct EnvLease {
    _count: LeaseCount,
    env_dir: PathBuf,
    interpreter: PathBuf,
}

impl EnvLease {
    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }
}

impl std::fmt::Debug for EnvLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvLease")
            .field("env_dir", &self.env_dir)
            .finish()
    }
}

pub struct EnvCache {
    dir: PathBuf,
    installer: Arc<dyn Installer>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl EnvCache {
    pub fn new(dir: impl Into<PathBuf>, installer: Arc<dyn Installer>) -> Self {
        Self {
            dir: dir.into(),
            installer,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a ready environment for `requirements`, installing it at
    /// most once. A failed install is evicted so the next call retries.
    pub async fn acquire(&self, requirements: &[String]) -> Result<EnvLease, InstallError> {
        let key = key_for(requirements);
        // Count the lease before releasing the map so prune() cannot evict
        // a slot that is about to be used
        let (slot, count) = {
            let mut slots = self.lock();
            let slot = Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
                Arc::new(Slot {
                    ready: OnceCell::new(),
                    leases: AtomicUsize::new(0),
                })
            }));
            let count = LeaseCount::new(Arc::clone(&slot));
            (slot, count)
        };

        let env_dir = self.dir.join(&key);
        let result = slot
            .ready
            .get_or_try_init(|| self.prepare(&key, &env_dir, requirements))
            .await
            .cloned();

        match result {
            Ok(interpreter) => Ok(EnvLease {
                _count: count,
                env_dir,
                interpreter,
            }),
            Err(e) => {
                warn!("Environment {key} failed to install: {e}");
                let mut slots = self.lock();
                if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(&key);
                }
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        key: &str,
        env_dir: &Path,
        requirements: &[String],
    ) -> Result<PathBuf, InstallError> {
        let interpreter = self.installer.interpreter(env_dir);
        let marker = env_dir.join(MARKER_FILE);
        if marker.is_file() {
            debug!("Reusing environment {}", env_dir.display());
            return Ok(interpreter);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let _lock = lock_exclusive(self.dir.join(format!("{key}.lock"))).await?;
        if marker.is_file() {
            debug!("Environment {} was installed by another process", env_dir.display());
            return Ok(interpreter);
        }

        // Leftover from an interrupted install
        if env_dir.exists() {
            tokio::fs::remove_dir_all(env_dir).await?;
        }

        info!(
            "Preparing environment {} with {}",
            env_dir.display(),
            self.installer.name()
        );
        self.installer.install(env_dir, requirements).await?;

        let mut sorted = requirements.to_vec();
        sorted.sort();
        tokio::fs::write(&marker, sorted.join("\n")).await?;
        Ok(interpreter)
    }

    /// Number of leases currently held.
    pub fn active_leases(&self) -> usize {
        self.lock()
            .values()
            .map(|s| s.leases.load(Ordering::SeqCst))
            .sum()
    }

    /// Drops entries nobody holds a lease on. Environments stay on disk.
    pub fn prune(&self) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.leases.load(Ordering::SeqCst) > 0);
        before - slots.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Opens and exclusively locks `path`, waiting for other holders. The lock
/// is released when the returned file is dropped.
async fn lock_exclusive(path: PathBuf) -> Result<File, InstallError> {
    let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(file)
}

/// Cache key of a dependency set: SHA-1 of the sorted requirement strings.
pub fn key_for(requirements: &[String]) -> String {
    let mut sorted: Vec<&str> = requirements.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for requirement in sorted {
        hasher.update(requirement.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
