//! Working-directory isolation for concurrent runs.
//!
//! The registry is the only shared mutable state in the harness. It is an
//! explicit value handed to every runner (usually behind an `Arc`), so tests
//! that want independent registries just build their own.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tflife_core::{Config, IsolationMode};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("working directory already in use: {}", path.display())]
    Conflict { path: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IsolationError>;

/// Isolation configuration.
#[derive(Debug, Clone)]
pub struct IsolationSettings {
    pub mode: IsolationMode,
    /// Upper bound on a blocking acquire (`None` = wait forever).
    pub acquire_timeout: Option<Duration>,
    /// Parent directory for private copies.
    pub work_root: PathBuf,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            mode: IsolationMode::Block,
            acquire_timeout: None,
            work_root: std::env::temp_dir().join("tflife"),
        }
    }
}

impl IsolationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.isolation_mode,
            acquire_timeout: (config.acquire_timeout_sec > 0)
                .then(|| Duration::from_secs(u64::from(config.acquire_timeout_sec))),
            work_root: config.work_root.clone(),
        }
    }
}

/// Process-wide set of working directories currently leased to runs.
#[derive(Debug)]
pub struct IsolationRegistry {
    in_use: Mutex<HashSet<PathBuf>>,
    released: Notify,
    settings: IsolationSettings,
}

impl IsolationRegistry {
    pub fn new(settings: IsolationSettings) -> Arc<Self> {
        Arc::new(Self {
            in_use: Mutex::new(HashSet::new()),
            released: Notify::new(),
            settings,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(IsolationSettings::default())
    }

    pub fn settings(&self) -> &IsolationSettings {
        &self.settings
    }

    /// Registry key for a path: canonical when it exists, as given otherwise.
    fn key(path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        // A panicking holder cannot leave the set half-updated.
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self, key: &Path) -> bool {
        self.lock().insert(key.to_path_buf())
    }

    fn release_key(&self, key: &Path) {
        let removed = self.lock().remove(key);
        if removed {
            debug!(path = %key.display(), "released working directory");
            self.released.notify_waiters();
        }
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.lock().contains(&Self::key(path))
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Lease `path` exclusively.
    ///
    /// In `FailFast` mode a held path is an immediate conflict. In `Block`
    /// mode the call waits for release, bounded by the acquire timeout.
    pub async fn acquire_work_dir(self: &Arc<Self>, path: &Path) -> Result<WorkDirLease> {
        let key = Self::key(path);
        let deadline = self
            .settings
            .acquire_timeout
            .map(|t| tokio::time::Instant::now() + t);

        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_claim(&key) {
                debug!(path = %key.display(), "acquired working directory");
                return Ok(WorkDirLease {
                    registry: Arc::clone(self),
                    path: key,
                    private_copy: false,
                    released: false,
                });
            }

            if self.settings.mode == IsolationMode::FailFast {
                warn!(path = %key.display(), "working directory already leased");
                return Err(IsolationError::Conflict { path: key });
            }

            info!(path = %key.display(), "waiting for working directory");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(path = %key.display(), "timed out waiting for working directory");
                        return Err(IsolationError::Conflict { path: key });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Copy `source` into a fresh `<work_root>/<base_name>-<uuid>` directory
    /// and lease the copy.
    ///
    /// Local state, the `.terraform` cache and other hidden files are left
    /// behind so every copy starts from a clean state namespace. The
    /// `.terraform-version` pin and the `.terraform.lock.hcl` provider lock
    /// are copied. If the copy or the lease fails, the partial copy is
    /// removed.
    pub async fn acquire_copy(
        self: &Arc<Self>,
        source: &Path,
        base_name: &str,
    ) -> Result<WorkDirLease> {
        let dest = self
            .settings
            .work_root
            .join(format!("{}-{}", sanitize(base_name), Uuid::now_v7()));

        let mut partial = PartialCopy::new(dest.clone());
        let src = source.to_path_buf();
        let dst = dest.clone();
        tokio::task::spawn_blocking(move || copy_config_dir(&src, &dst))
            .await
            .map_err(|e| IsolationError::Io(std::io::Error::other(e)))??;

        info!(
            source = %source.display(),
            dest = %dest.display(),
            "copied configuration to private working directory"
        );

        let mut lease = self.acquire_work_dir(&dest).await?;
        partial.keep();
        lease.private_copy = true;
        Ok(lease)
    }
}

/// Removes a private copy on drop unless it was handed to a lease.
struct PartialCopy {
    path: PathBuf,
    kept: bool,
}

impl PartialCopy {
    fn new(path: PathBuf) -> Self {
        Self { path, kept: false }
    }

    fn keep(&mut self) {
        self.kept = true;
    }
}

impl Drop for PartialCopy {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial copy"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove partial copy"
            ),
        }
    }
}

/// Exclusive hold on a working directory.
///
/// Released explicitly once teardown has finished; dropping an unreleased
/// lease also releases it.
#[derive(Debug)]
pub struct WorkDirLease {
    registry: Arc<IsolationRegistry>,
    path: PathBuf,
    private_copy: bool,
    released: bool,
}

impl WorkDirLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path is a private copy made by `acquire_copy`.
    pub fn is_private_copy(&self) -> bool {
        self.private_copy
    }

    pub fn release(mut self) {
        self.registry.release_key(&self.path);
        self.released = true;
    }

    /// Release and delete the directory if it is a private copy.
    ///
    /// Only call this after a clean teardown: a leaked run's state file is
    /// what an operator needs to clean up by hand.
    pub fn release_and_remove(self) {
        if self.private_copy {
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %err, "failed to remove private working directory");
            }
        }
        self.release();
    }
}

impl Drop for WorkDirLease {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release_key(&self.path);
        }
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

fn should_copy(name: &str) -> bool {
    if name == ".terraform-version" || name == ".terraform.lock.hcl" {
        return true;
    }
    !name.starts_with('.') && !name.contains(".tfstate")
}

fn copy_config_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if !should_copy(&name.to_string_lossy()) {
            continue;
        }
        let target = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copy_config_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
